//! Batched multi-window reads and deltas.
//!
//! A window list is applied in one descent: at every node the sorted list
//! is partitioned into the windows touching the left and right children,
//! and a window straddling the split is shortened in place for the left
//! recursion, then rewritten to describe the spill for the right one. The
//! caller's list is therefore mutated during the call; the windows it
//! describes are unchanged apart from such splits.

use super::{pair_of, CTree, Node};
use crate::error::StoreError;
use crate::handle::{Handle, InsertResult};
use crate::storage::Storage;

/// One window: a 24-bit word offset over an 8-bit length (1–255).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SparseOffset(pub(crate) u32);

impl SparseOffset {
    /// Pack a window. Offsets are absolute word positions.
    #[inline]
    pub fn new(offset: u32, len: u32) -> Self {
        debug_assert!(offset < 1 << 24);
        debug_assert!((1..256).contains(&len));
        Self(offset << 8 | len)
    }

    /// Word offset of the window.
    #[inline]
    pub fn offset(self) -> u32 {
        self.0 >> 8
    }

    /// Window length in words.
    #[inline]
    pub fn len(self) -> u32 {
        self.0 & 0xFF
    }
}

impl<S: Storage> CTree<S> {
    /// Read every window of `windows` into `buffer`, back to back.
    ///
    /// The list must be sorted ascending, non-overlapping and in bounds;
    /// it may be rewritten in place (split against subtree boundaries)
    /// during the call.
    pub fn get_sparse(
        &self,
        idx: Handle,
        windows: &mut [SparseOffset],
        buffer: &mut [u32],
        is_root: bool,
    ) {
        if windows.is_empty() {
            return;
        }
        debug_assert!(windows_well_formed(windows, idx.length()));
        let total: usize = windows.iter().map(|w| w.len() as usize).sum();
        self.expand_sparse(idx.id(), idx.length(), 0, windows, &mut buffer[..total], is_root);
    }

    /// Intern the vector equal to `idx` with each window overwritten by
    /// the corresponding run of `delta` words (windows packed back to
    /// back, in list order).
    ///
    /// Same list contract and in-place splitting as
    /// [`get_sparse`](Self::get_sparse).
    pub fn delta_sparse(
        &self,
        idx: Handle,
        delta: &[u32],
        windows: &mut [SparseOffset],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        let length = idx.length();
        if windows.is_empty() {
            return Ok(InsertResult::new(idx, false));
        }
        debug_assert!(windows_well_formed(windows, length));
        let raw = self
            .delta_sparse_apply(idx.id(), length, 0, delta, windows, is_root)
            .map_err(|e| self.fail(e))?;
        Ok(InsertResult::from_slot(raw, length))
    }

    fn expand_sparse(
        &self,
        id: u64,
        length: u64,
        internal: u32,
        windows: &mut [SparseOffset],
        buffer: &mut [u32],
        is_root: bool,
    ) {
        if windows.len() == 1 {
            let w = windows[0];
            self.expand_partial(
                id,
                length,
                u64::from((w.0 - internal) >> 8),
                u64::from(w.len()),
                buffer,
                is_root,
            );
            return;
        }
        // Two or more windows inside two words: just emit both words.
        if length == 2 {
            let pair = self.resolve(id, is_root);
            buffer[0] = pair as u32;
            buffer[1] = (pair >> 32) as u32;
            return;
        }
        let node = Node::from_raw(self.resolve(id, is_root));
        let left = Self::left_span(length);
        // Right child's start, in window encoding.
        let boundary = internal + ((left as u32) << 8);

        let mut left_n = 0;
        let mut left_words = 0usize;
        while left_n < windows.len() && windows[left_n].0 < boundary {
            left_words += windows[left_n].len() as usize;
            left_n += 1;
        }

        if left_n > 0 {
            let last = left_n - 1;
            let spill = (windows[last].0.wrapping_sub(boundary) as i32 >> 8)
                + windows[last].len() as i32;
            if spill > 0 {
                // Shorten the straddling window for the left descent,
                // then rewrite it as the spill into the right child.
                windows[last] = SparseOffset(windows[last].0 - spill as u32);
                left_words -= spill as usize;
                self.expand_sparse(
                    u64::from(node.left()),
                    left,
                    internal,
                    &mut windows[..left_n],
                    &mut buffer[..left_words],
                    false,
                );
                windows[last] = SparseOffset(boundary + spill as u32);
                left_n -= 1;
            } else {
                self.expand_sparse(
                    u64::from(node.left()),
                    left,
                    internal,
                    &mut windows[..left_n],
                    &mut buffer[..left_words],
                    false,
                );
            }
        }
        if left_n < windows.len() {
            self.expand_sparse(
                u64::from(node.right()),
                length - left,
                boundary,
                &mut windows[left_n..],
                &mut buffer[left_words..],
                false,
            );
        }
    }

    pub(crate) fn delta_sparse_apply(
        &self,
        id: u64,
        length: u64,
        internal: u32,
        delta: &[u32],
        windows: &mut [SparseOffset],
        is_root: bool,
    ) -> Result<u64, StoreError> {
        if windows.len() == 1 {
            let w = windows[0];
            return self.delta_apply(
                id,
                length,
                u64::from((w.0 - internal) >> 8),
                &delta[..w.len() as usize],
                is_root,
            );
        }
        // Two or more windows inside two words rewrite the whole pair.
        if length == 2 {
            return self.intern(pair_of(delta[0], delta[1]), 2, is_root);
        }
        let node = Node::from_raw(self.resolve(id, is_root));
        let left = Self::left_span(length);
        let boundary = internal + ((left as u32) << 8);

        let mut left_n = 0;
        let mut left_words = 0usize;
        while left_n < windows.len() && windows[left_n].0 < boundary {
            left_words += windows[left_n].len() as usize;
            left_n += 1;
        }

        let mut new = node;
        if left_n > 0 {
            let last = left_n - 1;
            let spill = (windows[last].0.wrapping_sub(boundary) as i32 >> 8)
                + windows[last].len() as i32;
            if spill > 0 {
                windows[last] = SparseOffset(windows[last].0 - spill as u32);
                left_words -= spill as usize;
                let l = self.delta_sparse_apply(
                    u64::from(node.left()),
                    left,
                    internal,
                    &delta[..left_words],
                    &mut windows[..left_n],
                    false,
                )?;
                new.set_left(l as u32);
                windows[last] = SparseOffset(boundary + spill as u32);
                left_n -= 1;
            } else {
                let l = self.delta_sparse_apply(
                    u64::from(node.left()),
                    left,
                    internal,
                    &delta[..left_words],
                    &mut windows[..left_n],
                    false,
                )?;
                new.set_left(l as u32);
            }
        }
        if left_n < windows.len() {
            let r = self.delta_sparse_apply(
                u64::from(node.right()),
                length - left,
                boundary,
                &delta[left_words..],
                &mut windows[left_n..],
                false,
            )?;
            new.set_right(r as u32);
        }
        self.intern(new.raw(), length, is_root)
    }
}

fn windows_well_formed(windows: &[SparseOffset], length: u64) -> bool {
    let mut end = 0u64;
    for w in windows {
        if w.len() == 0 || u64::from(w.offset()) < end {
            return false;
        }
        end = u64::from(w.offset()) + u64::from(w.len());
    }
    end <= length
}
