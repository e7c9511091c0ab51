//! Projection chains: windows that live inside referenced vectors.
//!
//! A vector may store the raw form of another vector's handle as two of
//! its words. A projection names a span through such references: a chain
//! of hops, each addressing a word offset in the current vector, where
//! every hop but the last reads a stored handle and descends into the
//! vector it names, and the last addresses the span itself.
//!
//! Batches of projections are walked together: consecutive projections
//! agreeing on the current hop offset descend through that reference
//! once, and on the way back out each level applies its accumulated
//! rewrites (modified sub-handles plus leaf spans) in a single sparse
//! pass.

use std::ops::Range;

use super::sparse::SparseOffset;
use super::CTree;
use crate::error::StoreError;
use crate::handle::{Handle, InsertResult};
use crate::storage::Storage;

/// What a projection hop does at its target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HopMode {
    /// Traversal only.
    None = 0,
    /// Fill the caller buffer from the span.
    Read = 1,
    /// Overwrite the span from the caller buffer.
    Write = 2,
    /// Overwrite the span and leave its previous content in the buffer.
    ReadWrite = 3,
}

impl HopMode {
    #[inline]
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => HopMode::None,
            1 => HopMode::Read,
            2 => HopMode::Write,
            _ => HopMode::ReadWrite,
        }
    }

    #[inline]
    fn reads(self) -> bool {
        matches!(self, HopMode::Read | HopMode::ReadWrite)
    }

    #[inline]
    fn writes(self) -> bool {
        matches!(self, HopMode::Write | HopMode::ReadWrite)
    }
}

/// One hop: a 24-bit word offset plus mode bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MultiOffset(u32);

impl MultiOffset {
    /// Pack a hop.
    #[inline]
    pub fn new(offset: u32, mode: HopMode) -> Self {
        debug_assert!(offset < 1 << 24);
        Self(offset << 8 | mode as u32)
    }

    /// Word offset within the current vector.
    #[inline]
    pub fn offset(self) -> u32 {
        self.0 >> 8
    }

    /// The hop's mode.
    #[inline]
    pub fn mode(self) -> HopMode {
        HopMode::from_bits(self.0 as u8)
    }
}

/// A batch of projections, stored flat with one hop row per projection
/// (stride `max_depth + 1`).
///
/// Projections must be ordered by their hop offsets (outermost first) and
/// their spans must not overlap; spans and stored-handle slots must be in
/// bounds of the vector they address.
pub struct MultiProjection {
    max_depth: usize,
    // (span length, hop count) per projection.
    records: Vec<(u32, u8)>,
    hops: Vec<MultiOffset>,
}

impl MultiProjection {
    /// An empty batch for chains of at most `max_depth` references.
    pub fn new(max_projections: usize, max_depth: usize) -> Self {
        Self {
            max_depth,
            records: Vec::with_capacity(max_projections),
            hops: Vec::with_capacity(max_projections * (max_depth + 1)),
        }
    }

    /// Append a projection: `hops` ending in the span hop, spanning
    /// `length` words.
    pub fn push(&mut self, length: u32, hops: &[MultiOffset]) {
        assert!(!hops.is_empty() && hops.len() <= self.max_depth + 1);
        assert!(length < 1 << 24);
        self.records.push((length, hops.len() as u8));
        self.hops.extend_from_slice(hops);
        // Pad the row to the fixed stride.
        self.hops
            .resize(self.records.len() * (self.max_depth + 1), MultiOffset(0));
    }

    /// Number of projections in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no projections were pushed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Words a read pass produces: the summed span lengths of reading
    /// final hops.
    pub fn read_words(&self) -> usize {
        self.total_words(|m| m.reads())
    }

    /// Words a write pass consumes or fills.
    pub fn rw_words(&self) -> usize {
        self.total_words(|m| m.reads() || m.writes())
    }

    fn total_words(&self, pred: impl Fn(HopMode) -> bool) -> usize {
        (0..self.len())
            .filter(|&i| pred(self.final_hop(i).mode()))
            .map(|i| self.records[i].0 as usize)
            .sum()
    }

    fn hops_of(&self, i: usize) -> &[MultiOffset] {
        let stride = self.max_depth + 1;
        &self.hops[i * stride..i * stride + self.records[i].1 as usize]
    }

    fn span_of(&self, i: usize) -> u64 {
        u64::from(self.records[i].0)
    }

    fn final_hop(&self, i: usize) -> MultiOffset {
        *self.hops_of(i).last().unwrap()
    }
}

impl<S: Storage> CTree<S> {
    /// Read every projection span of the batch into `buffer`, back to
    /// back in projection order. Hops before the last are traversal only;
    /// final hops participate when their mode reads.
    pub fn multi_get_partial(
        &self,
        idx: Handle,
        proj: &MultiProjection,
        buffer: &mut [u32],
        is_root: bool,
    ) {
        let mut out = 0usize;
        self.multi_read(idx, proj, 0..proj.len(), 0, buffer, &mut out, is_root);
    }

    fn multi_read(
        &self,
        idx: Handle,
        proj: &MultiProjection,
        members: Range<usize>,
        depth: usize,
        buffer: &mut [u32],
        out: &mut usize,
        is_root: bool,
    ) {
        let mut i = members.start;
        while i < members.end {
            let hops = proj.hops_of(i);
            let hop = hops[depth];
            if depth + 1 == hops.len() {
                if hop.mode().reads() {
                    let span = proj.span_of(i) as usize;
                    self.get_partial(
                        idx,
                        u64::from(hop.offset()),
                        span as u64,
                        &mut buffer[*out..*out + span],
                        is_root,
                    );
                    *out += span;
                }
                i += 1;
            } else {
                let group = self.chain_group(proj, &members, i, depth);
                let sub = self.read_handle_at(idx, u64::from(hop.offset()), is_root);
                self.multi_read(sub, proj, i..group, depth + 1, buffer, out, true);
                i = group;
            }
        }
    }

    /// Apply every projection of the batch in one pass: writing final
    /// hops splice their spans in from `buffer`, reading final hops fill
    /// their part of `buffer` from the pre-delta content, and rewritten
    /// references propagate back up the chains. Returns the handle of
    /// the rewritten outermost vector.
    pub fn multi_delta(
        &self,
        idx: Handle,
        proj: &MultiProjection,
        buffer: &mut [u32],
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        let mut cursor = 0usize;
        self.multi_write(idx, proj, 0..proj.len(), 0, buffer, &mut cursor, is_root)
            .map_err(|e| self.fail(e))
    }

    fn multi_write(
        &self,
        idx: Handle,
        proj: &MultiProjection,
        members: Range<usize>,
        depth: usize,
        buffer: &mut [u32],
        cursor: &mut usize,
        is_root: bool,
    ) -> Result<InsertResult, StoreError> {
        let mut windows: Vec<SparseOffset> = Vec::new();
        let mut delta: Vec<u32> = Vec::new();
        let mut i = members.start;
        while i < members.end {
            let hops = proj.hops_of(i);
            let hop = hops[depth];
            if depth + 1 == hops.len() {
                let span = proj.span_of(i) as usize;
                let mode = hop.mode();
                if mode.writes() {
                    push_windows(&mut windows, hop.offset(), span as u32);
                    delta.extend_from_slice(&buffer[*cursor..*cursor + span]);
                }
                if mode.reads() {
                    // Reads see the tree as it was before this pass; the
                    // new span content was already captured above.
                    self.get_partial(
                        idx,
                        u64::from(hop.offset()),
                        span as u64,
                        &mut buffer[*cursor..*cursor + span],
                        is_root,
                    );
                }
                if mode.reads() || mode.writes() {
                    *cursor += span;
                }
                i += 1;
            } else {
                let group = self.chain_group(proj, &members, i, depth);
                let sub = self.read_handle_at(idx, u64::from(hop.offset()), is_root);
                let new_sub =
                    self.multi_write(sub, proj, i..group, depth + 1, buffer, cursor, true)?;
                if new_sub.handle() != sub {
                    let raw = new_sub.handle().raw();
                    push_windows(&mut windows, hop.offset(), 2);
                    delta.push(raw as u32);
                    delta.push((raw >> 32) as u32);
                }
                i = group;
            }
        }
        if windows.is_empty() {
            return Ok(InsertResult::new(idx, false));
        }
        let raw =
            self.delta_sparse_apply(idx.id(), idx.length(), 0, &delta, &mut windows, is_root)?;
        Ok(InsertResult::from_slot(raw, idx.length()))
    }

    // Extent of the group of consecutive projections that keep descending
    // through the same reference at this depth.
    fn chain_group(
        &self,
        proj: &MultiProjection,
        members: &Range<usize>,
        i: usize,
        depth: usize,
    ) -> usize {
        let offset = proj.hops_of(i)[depth].offset();
        let mut j = i + 1;
        while j < members.end {
            let hops = proj.hops_of(j);
            if hops.len() <= depth + 1 || hops[depth].offset() != offset {
                break;
            }
            j += 1;
        }
        j
    }

    fn read_handle_at(&self, idx: Handle, offset: u64, is_root: bool) -> Handle {
        let mut words = [0u32; 2];
        self.get_partial(idx, offset, 2, &mut words, is_root);
        Handle::from_raw(u64::from(words[0]) | (u64::from(words[1]) << 32))
    }
}

// Spans wider than a sparse window allows are emitted as adjacent
// windows.
fn push_windows(windows: &mut Vec<SparseOffset>, mut offset: u32, mut span: u32) {
    while span > 255 {
        windows.push(SparseOffset::new(offset, 255));
        offset += 255;
        span -= 255;
    }
    windows.push(SparseOffset::new(offset, span));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn tree() -> CTree {
        CTree::with_config(Config {
            root_scale: 16,
            data_scale: 16,
        })
    }

    // An outer vector holding the handles of two inner vectors at word
    // offsets 2 and 6.
    fn nested_fixture(t: &CTree) -> (Handle, Handle, Handle, Vec<u32>) {
        let inner_a: Vec<u32> = (0..8).map(|i| 0xA000 + i).collect();
        let inner_b: Vec<u32> = (0..6).map(|i| 0xB000 + i).collect();
        let ha = t.insert(&inner_a, true).unwrap().handle();
        let hb = t.insert(&inner_b, true).unwrap().handle();
        let mut outer = vec![0x11u32, 0x22, 0, 0, 0x33, 0x44, 0, 0];
        outer[2] = ha.raw() as u32;
        outer[3] = (ha.raw() >> 32) as u32;
        outer[6] = hb.raw() as u32;
        outer[7] = (hb.raw() >> 32) as u32;
        let ho = t.insert(&outer, true).unwrap().handle();
        (ho, ha, hb, outer)
    }

    #[test]
    fn test_multi_read_direct_spans() {
        let t = tree();
        let data: Vec<u32> = (0..16).map(|i| 0xE000 + i).collect();
        let h = t.insert(&data, true).unwrap().handle();
        let mut proj = MultiProjection::new(2, 0);
        proj.push(3, &[MultiOffset::new(1, HopMode::Read)]);
        proj.push(2, &[MultiOffset::new(9, HopMode::Read)]);
        assert_eq!(proj.read_words(), 5);
        let mut out = vec![0u32; 5];
        t.multi_get_partial(h, &proj, &mut out, true);
        assert_eq!(out, [0xE001, 0xE002, 0xE003, 0xE009, 0xE00A]);
    }

    #[test]
    fn test_multi_read_through_references() {
        let t = tree();
        let (ho, _, _, _) = nested_fixture(&t);
        let mut proj = MultiProjection::new(3, 1);
        proj.push(2, &[MultiOffset::new(0, HopMode::Read)]);
        // Two projections through the same reference descend once.
        proj.push(
            3,
            &[
                MultiOffset::new(2, HopMode::None),
                MultiOffset::new(1, HopMode::Read),
            ],
        );
        proj.push(
            2,
            &[
                MultiOffset::new(2, HopMode::None),
                MultiOffset::new(5, HopMode::Read),
            ],
        );
        let mut out = vec![0u32; proj.read_words()];
        t.multi_get_partial(ho, &proj, &mut out, true);
        assert_eq!(out, [0x11, 0x22, 0xA001, 0xA002, 0xA003, 0xA005, 0xA006]);
    }

    #[test]
    fn test_multi_delta_writes_through_reference() {
        let t = tree();
        let (ho, ha, _, outer) = nested_fixture(&t);
        let mut proj = MultiProjection::new(2, 1);
        proj.push(
            2,
            &[
                MultiOffset::new(2, HopMode::None),
                MultiOffset::new(3, HopMode::Write),
            ],
        );
        let mut buffer = vec![0xF1u32, 0xF2];
        let r = t.multi_delta(ho, &proj, &mut buffer, true).unwrap();
        assert_ne!(r.handle(), ho);

        // The outer vector now references a rewritten inner A; B is
        // untouched.
        let mut new_outer = vec![0u32; 8];
        t.get(r.handle(), &mut new_outer, true);
        assert_eq!(&new_outer[..2], &outer[..2]);
        assert_eq!(&new_outer[4..6], &outer[4..6]);
        assert_eq!(&new_outer[6..8], &outer[6..8]);

        let new_ha = Handle::from_raw(
            u64::from(new_outer[2]) | (u64::from(new_outer[3]) << 32),
        );
        assert_ne!(new_ha, ha);
        assert_eq!(new_ha.length(), ha.length());
        let mut inner = vec![0u32; 8];
        t.get(new_ha, &mut inner, true);
        assert_eq!(
            inner,
            [0xA000, 0xA001, 0xA002, 0xF1, 0xF2, 0xA005, 0xA006, 0xA007]
        );
    }

    #[test]
    fn test_multi_delta_mixed_read_write() {
        let t = tree();
        let data: Vec<u32> = (0..12).map(|i| 0xC000 + i).collect();
        let h = t.insert(&data, true).unwrap().handle();
        let mut proj = MultiProjection::new(2, 0);
        proj.push(2, &[MultiOffset::new(1, HopMode::Read)]);
        proj.push(3, &[MultiOffset::new(5, HopMode::Write)]);
        // Buffer: two words filled by the read, three consumed by the
        // write.
        let mut buffer = vec![0u32, 0, 0x71, 0x72, 0x73];
        let r = t.multi_delta(h, &proj, &mut buffer, true).unwrap();
        assert_eq!(&buffer[..2], &[0xC001, 0xC002]);
        let mut out = vec![0u32; 12];
        t.get(r.handle(), &mut out, true);
        let mut expected = data.clone();
        expected[5..8].copy_from_slice(&[0x71, 0x72, 0x73]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_multi_delta_read_write_swaps() {
        let t = tree();
        let data: Vec<u32> = (0..8).map(|i| 0xD000 + i).collect();
        let h = t.insert(&data, true).unwrap().handle();
        let mut proj = MultiProjection::new(1, 0);
        proj.push(2, &[MultiOffset::new(3, HopMode::ReadWrite)]);
        let mut buffer = vec![0x81u32, 0x82];
        let r = t.multi_delta(h, &proj, &mut buffer, true).unwrap();
        // The buffer now holds the old content.
        assert_eq!(buffer, [0xD003, 0xD004]);
        let mut out = vec![0u32; 8];
        t.get(r.handle(), &mut out, true);
        let mut expected = data.clone();
        expected[3..5].copy_from_slice(&[0x81, 0x82]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_multi_delta_nothing_to_write_is_noop() {
        let t = tree();
        let data: Vec<u32> = (0..6).collect();
        let h = t.insert(&data, true).unwrap().handle();
        let mut proj = MultiProjection::new(1, 0);
        proj.push(2, &[MultiOffset::new(1, HopMode::Read)]);
        let mut buffer = vec![0u32; 2];
        let r = t.multi_delta(h, &proj, &mut buffer, true).unwrap();
        assert_eq!(r.handle(), h);
        assert!(!r.fresh());
        assert_eq!(buffer, [1, 2]);
    }

    #[test]
    fn test_multi_delta_two_levels_deep() {
        let t = tree();
        // innermost → middle → outer
        let innermost: Vec<u32> = (0..4).map(|i| 0x9000 + i).collect();
        let hi = t.insert(&innermost, true).unwrap().handle();
        let mut middle = vec![0u32; 4];
        middle[0] = hi.raw() as u32;
        middle[1] = (hi.raw() >> 32) as u32;
        let hm = t.insert(&middle, true).unwrap().handle();
        let mut outer = vec![0u32; 4];
        outer[2] = hm.raw() as u32;
        outer[3] = (hm.raw() >> 32) as u32;
        let ho = t.insert(&outer, true).unwrap().handle();

        let mut proj = MultiProjection::new(1, 2);
        proj.push(
            1,
            &[
                MultiOffset::new(2, HopMode::None),
                MultiOffset::new(0, HopMode::None),
                MultiOffset::new(3, HopMode::Write),
            ],
        );
        let mut buffer = vec![0x42u32];
        let r = t.multi_delta(ho, &proj, &mut buffer, true).unwrap();

        // Follow the rewritten chain back down.
        let mut new_outer = vec![0u32; 4];
        t.get(r.handle(), &mut new_outer, true);
        let new_hm = Handle::from_raw(
            u64::from(new_outer[2]) | (u64::from(new_outer[3]) << 32),
        );
        let mut new_middle = vec![0u32; 4];
        t.get(new_hm, &mut new_middle, true);
        let new_hi = Handle::from_raw(
            u64::from(new_middle[0]) | (u64::from(new_middle[1]) << 32),
        );
        let mut new_innermost = vec![0u32; 4];
        t.get(new_hi, &mut new_innermost, true);
        assert_eq!(new_innermost, [0x9000, 0x9001, 0x9002, 0x42]);
    }
}
