//! The compression tree.
//!
//! A vector of `n` 32-bit words is decomposed into a binary tree of
//! 64-bit pairs. Every distinct pair is interned once and replaced by its
//! slot index, so the parent level packs two 32-bit slot indices into the
//! next pair, until one pair roots the whole vector. The tree is
//! *implicit*: nothing about its shape is stored. For a vector of length
//! `n ≥ 3` the left child always spans `2^⌊log2(n−1)⌋` words and is
//! perfectly balanced, so the caller-supplied length at each level fully
//! determines where to descend.
//!
//! Insert a six-word vector `[a b c d e f]` and the table gains:
//!
//! ```text
//!   [ a][ b][ c][ d][ e][ f]
//!     [ 1]    [ 2]    [ 3]
//!         [ 4]
//!                 [ 5]       1 → (a,b)  2 → (c,d)  3 → (e,f)
//!                            4 → (1,2)  5 → (4,3)
//! ```
//!
//! A second vector differing in one word re-interns only the spine above
//! that word; every other subtree is shared by construction. That sharing
//! is also what the delta operations exploit: they reconstruct only the
//! interior nodes a window touches and return the input handle untouched
//! when nothing changed.

mod multi;
mod sparse;

pub use multi::{HopMode, MultiOffset, MultiProjection};
pub use sparse::SparseOffset;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::handle::{Handle, InsertResult};
use crate::hashset::NOT_FOUND;
use crate::storage::{SeparateRoot, Storage, StoreStats};

type FullHandler = Box<dyn Fn(u64, bool) + Send + Sync>;

/// A 64-bit interior node: two 32-bit children packed side by side.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Node(u64);

impl Node {
    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Node(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn left(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) fn right(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub(crate) fn left_part(self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    #[inline]
    pub(crate) fn right_part(self) -> u64 {
        self.0 & 0xFFFF_FFFF_0000_0000
    }

    #[inline]
    pub(crate) fn set_left(&mut self, w: u32) {
        self.0 = (self.0 & 0xFFFF_FFFF_0000_0000) | u64::from(w);
    }

    #[inline]
    pub(crate) fn set_right(&mut self, w: u32) {
        self.0 = (self.0 & 0xFFFF_FFFF) | (u64::from(w) << 32);
    }
}

#[inline]
pub(crate) fn pair_of(left: u32, right: u32) -> u64 {
    u64::from(left) | (u64::from(right) << 32)
}

/// The concurrent compression store.
///
/// All operations are callable from any number of threads without
/// external locking; racing inserts of equal content converge on the same
/// handle and exactly one of them reports it fresh.
///
/// The `is_root` flag on every operation selects the surrogate space of
/// the *topmost* pair: pass `true` for externally held handles and use
/// the same value for lookup as for insertion of a given handle.
pub struct CTree<S: Storage = SeparateRoot> {
    storage: S,
    full_handler: RwLock<Option<FullHandler>>,
}

impl<S: Storage> CTree<S> {
    /// Wrap a storage policy.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            full_handler: RwLock::new(None),
        }
    }

    /// The backing storage policy.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Occupancy of the backing tables.
    pub fn stats(&self) -> StoreStats {
        self.storage.stats()
    }

    /// Register a hook observing table-full aborts. It runs once per
    /// failed public operation, after the recursion has unwound, with the
    /// pair that could not be placed and the root flag of the failing
    /// intern.
    pub fn set_full_handler(&self, handler: impl Fn(u64, bool) + Send + Sync + 'static) {
        *self.full_handler.write() = Some(Box::new(handler));
    }

    fn fail(&self, err: StoreError) -> StoreError {
        if let StoreError::TableFull { key, root } = err {
            if let Some(handler) = self.full_handler.read().as_ref() {
                handler(key, root);
            }
        }
        err
    }

    // ------------------------------------------------------------------
    // Shape arithmetic
    // ------------------------------------------------------------------

    // level 0 covers lengths up to 2, level k the lengths (2^k, 2^(k+1)].
    // The left child of a length-n node spans 1 << level_of(n) words.
    #[inline]
    fn level_of(length: u64) -> u32 {
        debug_assert!(length >= 2);
        63 - (length - 1).leading_zeros()
    }

    #[inline]
    fn left_span(length: u64) -> u64 {
        1 << Self::level_of(length)
    }

    // ------------------------------------------------------------------
    // Single-node storage access
    // ------------------------------------------------------------------

    fn intern(&self, pair: u64, length: u64, is_root: bool) -> Result<u64, StoreError> {
        let slot = self.storage.fop(pair, length, is_root);
        if slot == NOT_FOUND {
            return Err(StoreError::TableFull {
                key: pair,
                root: is_root,
            });
        }
        Ok(slot)
    }

    #[inline]
    pub(crate) fn resolve(&self, slot: u64, is_root: bool) -> u64 {
        self.storage.get(slot, is_root)
    }

    /// Re-anchor a root surrogate into the data table so the tree it
    /// names can become a child of a larger tree.
    fn unroot(&self, id: u64, length: u64, is_root: bool) -> Result<u64, StoreError> {
        if !is_root || length < 2 || id == 0 {
            return Ok(id);
        }
        let pair = self.resolve(id, true);
        Ok(self.intern(pair, length, false)? & Handle::ID_MASK)
    }

    // ------------------------------------------------------------------
    // Insert / find
    // ------------------------------------------------------------------

    /// Intern a vector, returning its handle and whether this call
    /// created the top-level entry.
    pub fn insert(&self, data: &[u32], is_root: bool) -> Result<InsertResult, StoreError> {
        let length = data.len() as u64;
        if length > Handle::MAX_LENGTH {
            return Err(StoreError::LengthLimit(length));
        }
        if length == 0 {
            return Ok(InsertResult::new(Handle::EMPTY, false));
        }
        let raw = self.build(data, is_root).map_err(|e| self.fail(e))?;
        Ok(InsertResult::from_slot(raw, length))
    }

    // Bottom-up deconstruction. The returned raw slot carries the
    // freshness bit of the top-level intern; child slots are truncated to
    // 32 bits when packed, which also drops their freshness bits.
    fn build(&self, data: &[u32], is_root: bool) -> Result<u64, StoreError> {
        match data.len() {
            1 => Ok(u64::from(data[0])),
            2 => self.intern(pair_of(data[0], data[1]), 2, is_root),
            n => {
                let left = Self::left_span(n as u64) as usize;
                let l = self.build(&data[..left], false)? as u32;
                let r = self.build(&data[left..], false)? as u32;
                self.intern(pair_of(l, r), n as u64, is_root)
            }
        }
    }

    /// Look a vector up without inserting anything. `None` as soon as any
    /// sub-pair is missing.
    pub fn find(&self, data: &[u32], is_root: bool) -> Option<Handle> {
        let length = data.len() as u64;
        if length > Handle::MAX_LENGTH {
            return None;
        }
        if length == 0 {
            return Some(Handle::EMPTY);
        }
        let slot = self.seek(data, is_root)?;
        Some(Handle::new(slot & Handle::ID_MASK, length))
    }

    fn seek(&self, data: &[u32], is_root: bool) -> Option<u64> {
        match data.len() {
            1 => Some(u64::from(data[0])),
            2 => checked(self.storage.find(pair_of(data[0], data[1]), 2, is_root)),
            n => {
                let left = Self::left_span(n as u64) as usize;
                let l = self.seek(&data[..left], false)? as u32;
                let r = self.seek(&data[left..], false)? as u32;
                checked(self.storage.find(pair_of(l, r), n as u64, is_root))
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconstruction
    // ------------------------------------------------------------------

    /// Reconstruct the whole vector into `buffer`.
    ///
    /// # Panics
    ///
    /// Panics when `buffer` is shorter than the handle's length.
    pub fn get(&self, idx: Handle, buffer: &mut [u32], is_root: bool) {
        let length = idx.length();
        if length == 0 {
            return;
        }
        let buffer = &mut buffer[..length as usize];
        if length == 1 {
            buffer[0] = idx.id() as u32;
            return;
        }
        if idx.id() == 0 {
            buffer.fill(0);
            return;
        }
        let pair = self.resolve(idx.id(), is_root);
        if length == 2 {
            buffer[0] = pair as u32;
            buffer[1] = (pair >> 32) as u32;
            return;
        }
        if pair == 0 {
            buffer.fill(0);
            return;
        }
        let balanced = 1u64 << (63 - length.leading_zeros());
        if balanced == length {
            self.expand_pow2_pair(pair, length, buffer);
        } else {
            let node = Node::from_raw(pair);
            self.expand_pow2(u64::from(node.left()), balanced, buffer);
            self.expand(
                u64::from(node.right()),
                length - balanced,
                &mut buffer[balanced as usize..],
            );
        }
    }

    // General top-down expansion of an interior subtree.
    fn expand(&self, id: u64, length: u64, buffer: &mut [u32]) {
        if length == 1 {
            buffer[0] = id as u32;
            return;
        }
        if id == 0 {
            buffer[..length as usize].fill(0);
            return;
        }
        let balanced = 1u64 << (63 - length.leading_zeros());
        if balanced == length {
            self.expand_pow2(id, length, buffer);
        } else {
            let node = Node::from_raw(self.resolve(id, false));
            self.expand_pow2(u64::from(node.left()), balanced, buffer);
            self.expand(
                u64::from(node.right()),
                length - balanced,
                &mut buffer[balanced as usize..],
            );
        }
    }

    fn expand_pow2(&self, id: u64, length: u64, buffer: &mut [u32]) {
        self.expand_pow2_pair(self.resolve(id, false), length, buffer);
    }

    // Balanced expansion without recursion: the buffer prefix holds one
    // slot index per subtree of the current level; walking the level
    // backwards widens each index into its pair in place.
    fn expand_pow2_pair(&self, pair: u64, length: u64, buffer: &mut [u32]) {
        buffer[0] = pair as u32;
        buffer[1] = (pair >> 32) as u32;
        let mut level_len = 2usize;
        while (level_len as u64) < length {
            for i in (0..level_len).rev() {
                let p = self.resolve(u64::from(buffer[i]), false);
                buffer[2 * i] = p as u32;
                buffer[2 * i + 1] = (p >> 32) as u32;
            }
            level_len <<= 1;
        }
    }

    /// Reconstruct the window `[offset, offset + span)` into `buffer`,
    /// descending only into subtrees the window intersects.
    ///
    /// # Panics
    ///
    /// Panics when the window is out of bounds or `buffer` is shorter
    /// than `span`.
    pub fn get_partial(&self, idx: Handle, offset: u64, span: u64, buffer: &mut [u32], is_root: bool) {
        assert!(offset + span <= idx.length(), "window out of bounds");
        if span == 0 {
            return;
        }
        self.expand_partial(idx.id(), idx.length(), offset, span, &mut buffer[..span as usize], is_root);
    }

    pub(crate) fn expand_partial(
        &self,
        id: u64,
        length: u64,
        offset: u64,
        span: u64,
        buffer: &mut [u32],
        is_root: bool,
    ) {
        if length == 1 {
            buffer[0] = id as u32;
            return;
        }
        if id == 0 {
            buffer[..span as usize].fill(0);
            return;
        }
        if length == 2 {
            let pair = self.resolve(id, is_root);
            if span == 2 {
                buffer[0] = pair as u32;
                buffer[1] = (pair >> 32) as u32;
            } else if offset == 0 {
                buffer[0] = pair as u32;
            } else {
                buffer[0] = (pair >> 32) as u32;
            }
            return;
        }
        let node = Node::from_raw(self.resolve(id, is_root));
        let left = Self::left_span(length);
        if offset < left {
            let left_avail = left - offset;
            if span > left_avail {
                self.expand_partial(u64::from(node.left()), left, offset, left_avail, buffer, false);
                self.expand_partial(
                    u64::from(node.right()),
                    length - left,
                    0,
                    span - left_avail,
                    &mut buffer[left_avail as usize..],
                    false,
                );
            } else {
                self.expand_partial(u64::from(node.left()), left, offset, span, buffer, false);
            }
        } else {
            self.expand_partial(
                u64::from(node.right()),
                length - left,
                offset - left,
                span,
                buffer,
                false,
            );
        }
    }

    // ------------------------------------------------------------------
    // Point delta
    // ------------------------------------------------------------------

    /// Intern the vector equal to `idx` with `delta` overwriting the
    /// window starting at `offset`. Returns the input handle unchanged
    /// when the window content already matches.
    ///
    /// # Panics
    ///
    /// Panics when the window does not fit inside the vector.
    pub fn delta(
        &self,
        idx: Handle,
        offset: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        let length = idx.length();
        assert!(offset + delta.len() as u64 <= length, "delta out of bounds");
        if delta.is_empty() {
            return Ok(InsertResult::new(idx, false));
        }
        if length == 1 {
            return Ok(InsertResult::new(Handle::new(u64::from(delta[0]), 1), false));
        }
        let raw = self
            .delta_apply(idx.id(), length, offset, delta, is_root)
            .map_err(|e| self.fail(e))?;
        Ok(InsertResult::from_slot(raw, length))
    }

    // Returns the incoming id (freshness clear) when the reconstructed
    // pair equals the stored one; that is what keeps untouched spines
    // shared.
    pub(crate) fn delta_apply(
        &self,
        id: u64,
        length: u64,
        offset: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<u64, StoreError> {
        if length == 1 {
            debug_assert!(offset == 0);
            return Ok(u64::from(delta[0]));
        }
        let node = Node::from_raw(self.resolve(id, is_root));
        if length == 2 {
            // delta.len() can exceed the subtree when a window was split
            // against a larger sibling; only the covered words apply.
            if delta.len() >= 2 {
                return self.intern(pair_of(delta[0], delta[1]), 2, is_root);
            }
            let mut n = node;
            if offset == 0 {
                n.set_left(delta[0]);
            } else {
                n.set_right(delta[0]);
            }
            return self.intern(n.raw(), 2, is_root);
        }
        let left = Self::left_span(length);
        let new = if offset < left {
            let left_avail = left - offset;
            if (delta.len() as u64) > left_avail {
                let (dl, dr) = delta.split_at(left_avail as usize);
                let l = self.delta_apply(u64::from(node.left()), left, offset, dl, false)?;
                let r = self.delta_apply(u64::from(node.right()), length - left, 0, dr, false)?;
                pair_of(l as u32, r as u32)
            } else {
                let l = self.delta_apply(u64::from(node.left()), left, offset, delta, false)?;
                (l & 0xFFFF_FFFF) | node.right_part()
            }
        } else {
            let r = self.delta_apply(u64::from(node.right()), length - left, offset - left, delta, false)?;
            ((r as u32 as u64) << 32) | node.left_part()
        };
        if new == node.raw() {
            Ok(id)
        } else {
            self.intern(new, length, is_root)
        }
    }

    // ------------------------------------------------------------------
    // Extension
    // ------------------------------------------------------------------

    /// Append `delta` after zero-padding the vector up to `alignment`
    /// words (a nonzero power of two).
    pub fn extend(
        &self,
        idx: Handle,
        alignment: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a nonzero power of two"
        );
        let length = idx.length();
        let padding = ((length + alignment - 1) & !(alignment - 1)) - length;
        self.extend_at(idx, padding, delta, is_root)
    }

    /// Append `padding` zero words and then `delta` to the vector.
    pub fn extend_at(
        &self,
        idx: Handle,
        padding: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        let length = idx.length();
        let new_length = length + padding + delta.len() as u64;
        if new_length > Handle::MAX_LENGTH {
            return Err(StoreError::LengthLimit(new_length));
        }
        let raw = if !idx.exists() {
            if delta.is_empty() {
                Ok(0)
            } else {
                self.insert_zero_prepended(delta, padding, is_root)
            }
        } else if delta.is_empty() {
            self.zero_extend(idx.id(), length, length + padding, is_root, is_root)
        } else {
            self.extend_tree(idx.id(), length, padding, delta, is_root, is_root)
        }
        .map_err(|e| self.fail(e))?;
        Ok(InsertResult::from_slot(raw, new_length))
    }

    // Intern `padding` zeros followed by `data`. The zero side needs no
    // table entries at all: a child of 0 already reads back as zeros.
    fn insert_zero_prepended(
        &self,
        data: &[u32],
        padding: u64,
        is_root: bool,
    ) -> Result<u64, StoreError> {
        if padding == 0 {
            return self.build(data, is_root);
        }
        let new_length = data.len() as u64 + padding;
        let left = Self::left_span(new_length);
        if left == padding {
            let r = self.build(data, false)? as u32;
            self.intern(u64::from(r) << 32, new_length, is_root)
        } else if left < padding {
            let r = self.insert_zero_prepended(data, padding - left, false)? as u32;
            self.intern(u64::from(r) << 32, new_length, is_root)
        } else {
            let head = (left - padding) as usize;
            let l = self.insert_zero_prepended(&data[..head], padding, false)? as u32;
            let r = self.build(&data[head..], false)? as u32;
            self.intern(pair_of(l, r), new_length, is_root)
        }
    }

    // Grow a tree of `length` words to `extend_to` words of which the
    // tail is all zeros. `is_root` describes where `id` lives, `to_root`
    // where the result goes.
    fn zero_extend(
        &self,
        id: u64,
        length: u64,
        extend_to: u64,
        is_root: bool,
        to_root: bool,
    ) -> Result<u64, StoreError> {
        if extend_to == length {
            return Ok(id);
        }
        let left = Self::left_span(extend_to);
        if left == length {
            let l = self.unroot(id, length, is_root)? as u32;
            self.intern(u64::from(l), extend_to, to_root)
        } else if left < length {
            let node = Node::from_raw(self.resolve(id, is_root));
            let r = self.zero_extend(u64::from(node.right()), length - left, extend_to - left, false, false)? as u32;
            self.intern(node.left_part() | (u64::from(r) << 32), extend_to, to_root)
        } else {
            let l = self.zero_extend(id, length, left, is_root, false)? as u32;
            self.intern(u64::from(l), extend_to, to_root)
        }
    }

    // The general case: original tree, a run of zeros, then delta words.
    fn extend_tree(
        &self,
        id: u64,
        length: u64,
        padding: u64,
        delta: &[u32],
        is_root: bool,
        to_root: bool,
    ) -> Result<u64, StoreError> {
        let new_length = length + padding + delta.len() as u64;
        if new_length == 2 {
            // Single original word, no padding, single delta word.
            return self.intern(id | (u64::from(delta[0]) << 32), 2, to_root);
        }
        let left = Self::left_span(new_length);
        let zero_extended = length + padding;
        if left == length {
            // Left child is exactly the original tree.
            let l = self.unroot(id, length, is_root)? as u32;
            let r = self.insert_zero_prepended(delta, padding, false)? as u32;
            self.intern(pair_of(l, r), new_length, to_root)
        } else if left < length {
            // Left child is an unchanged prefix of the original.
            let node = Node::from_raw(self.resolve(id, is_root));
            let r = self.extend_tree(u64::from(node.right()), length - left, padding, delta, false, false)? as u32;
            self.intern(node.left_part() | (u64::from(r) << 32), new_length, to_root)
        } else if zero_extended >= left {
            // Left child is the original plus some of the zeros.
            let l = self.zero_extend(id, length, left, is_root, false)? as u32;
            let r = self.insert_zero_prepended(delta, zero_extended - left, false)? as u32;
            self.intern(pair_of(l, r), new_length, to_root)
        } else {
            // Delta words spill into the left child.
            let spill = (left - zero_extended) as usize;
            let l = self.extend_tree(id, length, padding, &delta[..spill], is_root, false)? as u32;
            let r = self.build(&delta[spill..], false)? as u32;
            self.intern(pair_of(l, r), new_length, to_root)
        }
    }

    // ------------------------------------------------------------------
    // Delta that may extend
    // ------------------------------------------------------------------

    /// As [`delta`](Self::delta), but the window may reach past the end
    /// of the vector; the gap between the old tail and `offset` is
    /// zero-filled and the result length is
    /// `max(length, offset + delta.len())`.
    pub fn delta_may_extend(
        &self,
        idx: Handle,
        offset: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        if delta.is_empty() {
            return Ok(InsertResult::new(idx, false));
        }
        let length = idx.length();
        let new_length = length.max(offset + delta.len() as u64);
        if new_length > Handle::MAX_LENGTH {
            return Err(StoreError::LengthLimit(new_length));
        }
        let raw = self
            .delta_extend_apply(idx.id(), length, offset, delta, is_root)
            .map_err(|e| self.fail(e))?;
        Ok(InsertResult::from_slot(raw, new_length))
    }

    fn delta_extend_apply(
        &self,
        id: u64,
        length: u64,
        offset: u64,
        delta: &[u32],
        is_root: bool,
    ) -> Result<u64, StoreError> {
        if length == 0 {
            return self.insert_zero_prepended(delta, offset, is_root);
        }
        let reach = offset + delta.len() as u64;
        if reach <= length {
            // Fully in bounds.
            if length == 1 {
                return Ok(u64::from(delta[0]));
            }
            return self.delta_apply(id, length, offset, delta, is_root);
        }
        if offset == 0 {
            // The delta replaces the whole vector.
            if delta.len() == 1 {
                return Ok(u64::from(delta[0]));
            }
            return self.build(delta, is_root);
        }
        if offset >= length {
            // Entirely beyond the old tail.
            return self.extend_tree(id, length, offset - length, delta, is_root, is_root);
        }
        // Overlapping the tail: the result tree is shaped by the new
        // length, the original by the old one.
        let left = Self::left_span(reach);
        if offset < left {
            let covered = (left - offset) as usize;
            let l = if length > left {
                let node = Node::from_raw(self.resolve(id, is_root));
                self.delta_extend_apply(u64::from(node.left()), left, offset, &delta[..covered], false)?
            } else {
                let sub = self.unroot(id, length, is_root)?;
                self.delta_extend_apply(sub, length, offset, &delta[..covered], false)?
            };
            let r = self.build(&delta[covered..], false)?;
            self.intern(pair_of(l as u32, r as u32), reach, is_root)
        } else {
            let node = Node::from_raw(self.resolve(id, is_root));
            let r = self.delta_extend_apply(
                u64::from(node.right()),
                length - left,
                offset - left,
                delta,
                false,
            )? as u32;
            self.intern(node.left_part() | (u64::from(r) << 32), reach, is_root)
        }
    }
}

impl CTree<SeparateRoot> {
    /// Build a store over the canonical separate-root policy.
    pub fn with_config(config: crate::Config) -> Self {
        Self::new(SeparateRoot::new(config.root_scale, config.data_scale))
    }
}

#[inline]
fn checked(slot: u64) -> Option<u64> {
    (slot != NOT_FOUND).then_some(slot)
}
