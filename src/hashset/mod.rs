//! Lock-free open-addressed interning sets.
//!
//! Both tables are fixed-capacity arrays of atomic cells backed by an
//! anonymous demand-paged mapping, so reserving a large table costs
//! address space, not resident memory. Entries are write-once: a writer
//! claims an empty cell with a single compare-and-swap and the cell never
//! changes again, which is what makes relaxed probing loads sound.
//!
//! A cell value of 0 means "empty", so the key 0 itself cannot be stored.
//! [`HashSet64`] resolves that with a per-table "zeros seen" flag: the
//! zero key is interned at the reserved slot 0 without touching the
//! table, and the flag arbitrates which caller sees the claim as fresh.

mod probe;

pub use probe::{Linear, LinearBlock, Prober, QuadLinear};

use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::MmapMut;

/// Flag bit set on an insert result when the call claimed the slot.
pub const FRESH: u64 = 1 << 63;

/// Sentinel distinct from every valid slot: the table is full (insert) or
/// the key is absent (find).
pub const NOT_FOUND: u64 = u64::MAX;

/// Tag bit on the length word of a 128-bit cell marking a stored zero
/// pair (which is encoded as `u64::MAX` so the cell reads as occupied).
const ZERO_TAG: u64 = 1 << 63;

/// Occupancy of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Bytes of address space reserved for the cell array.
    pub bytes_reserved: usize,
    /// Number of occupied slots.
    pub slots_used: usize,
}

impl AddAssign for TableStats {
    fn add_assign(&mut self, other: Self) {
        self.bytes_reserved += other.bytes_reserved;
        self.slots_used += other.slots_used;
    }
}

/// Probe behaviour observed while locating one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    /// Slots examined, including the home slot.
    pub probes: usize,
    /// The home slot of the key.
    pub first_slot: u64,
    /// The slot the search ended at.
    pub final_slot: u64,
    /// Claim attempts lost to a racing writer.
    pub failed_cas: usize,
}

fn check_scale(scale: u32, max: u32) {
    assert!(
        (3..=max).contains(&scale),
        "table scale {scale} outside supported range 3..={max}"
    );
}

fn map_cells(words: usize) -> MmapMut {
    MmapMut::map_anon(words * 8).expect("failed to map table")
}

/// View a zero-initialized mapping as atomic 64-bit cells.
///
/// Safety: the mapping is page-aligned and at least `words * 8` bytes, and
/// `AtomicU64` is a transparent wrapper with no invalid bit patterns. The
/// mapping is only ever accessed through this view once the table is
/// constructed.
fn cells(map: &MmapMut, words: usize) -> &[AtomicU64] {
    debug_assert!(map.len() >= words * 8);
    unsafe { std::slice::from_raw_parts(map.as_ptr() as *const AtomicU64, words) }
}

/// Lock-free interning set of nonzero 64-bit keys.
///
/// `insert` returns the slot of an equal key, or claims a fresh slot and
/// returns it with the high bit set, or [`NOT_FOUND`] when the probe
/// budget is exhausted. Slots are stable for the life of the table and
/// slot 0 is never handed out by probing.
pub struct HashSet64<P: Prober = QuadLinear> {
    map: MmapMut,
    mask: u64,
    scale: u32,
    zeros: AtomicBool,
    _probe: PhantomData<fn() -> P>,
}

impl<P: Prober> HashSet64<P> {
    /// Allocate a table of `2^scale` cells.
    pub fn new(scale: u32) -> Self {
        check_scale(scale, 40);
        let buckets = 1usize << scale;
        Self {
            map: map_cells(buckets),
            mask: buckets as u64 - 1,
            scale,
            zeros: AtomicBool::new(false),
            _probe: PhantomData,
        }
    }

    /// Table capacity exponent.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    #[inline]
    fn cells(&self) -> &[AtomicU64] {
        cells(&self.map, (self.mask + 1) as usize)
    }

    // Identity hash: tree-layer keys are pairs of surrogates and already
    // spread well. Any mixer substituted here must keep hash(0) == 0.
    #[inline]
    fn home(&self, key: u64) -> u64 {
        key & self.mask
    }

    /// Find-or-insert. See the type docs for the result encoding.
    #[inline]
    pub fn insert(&self, key: u64) -> u64 {
        self.search::<true, false>(key, &mut ProbeStats::default())
    }

    /// Find only; [`NOT_FOUND`] when absent.
    #[inline]
    pub fn find(&self, key: u64) -> u64 {
        self.search::<false, false>(key, &mut ProbeStats::default())
    }

    /// As [`insert`](Self::insert), recording probe behaviour.
    pub fn insert_tracked(&self, key: u64, stats: &mut ProbeStats) -> u64 {
        self.search::<true, true>(key, stats)
    }

    /// As [`find`](Self::find), recording probe behaviour.
    pub fn find_tracked(&self, key: u64, stats: &mut ProbeStats) -> u64 {
        self.search::<false, true>(key, stats)
    }

    /// The key stored at `slot`. Defined for every slot returned by a
    /// successful insert or find; slot 0 reads as the zero key.
    #[inline]
    pub fn get(&self, slot: u64) -> u64 {
        self.cells()[slot as usize].load(Ordering::Relaxed)
    }

    fn search<const INSERT: bool, const TRACK: bool>(
        &self,
        key: u64,
        stats: &mut ProbeStats,
    ) -> u64 {
        if key == 0 {
            return self.intern_zero::<INSERT>();
        }
        let cells = self.cells();
        let mut slot = self.home(key);
        let mut prober = P::start(slot, self.mask);
        if TRACK {
            *stats = ProbeStats {
                probes: 1,
                first_slot: slot,
                final_slot: slot,
                failed_cas: 0,
            };
        }
        loop {
            if slot != 0 {
                if TRACK {
                    stats.final_slot = slot;
                }
                let cell = &cells[slot as usize];
                let cur = cell.load(Ordering::Relaxed);
                if cur == 0 {
                    if !INSERT {
                        return NOT_FOUND;
                    }
                    match cell.compare_exchange(0, key, Ordering::Release, Ordering::Relaxed) {
                        Ok(_) => return FRESH | slot,
                        Err(seen) => {
                            if TRACK {
                                stats.failed_cas += 1;
                            }
                            if seen == key {
                                return slot;
                            }
                        }
                    }
                } else if cur == key {
                    return slot;
                }
            }
            slot = match prober.next() {
                Some(s) => s,
                None => return NOT_FOUND,
            };
            if TRACK {
                stats.probes += 1;
            }
        }
    }

    // The zero key is indistinguishable from an empty cell, so it lives at
    // the reserved slot 0 and the flag decides who claimed it.
    fn intern_zero<const INSERT: bool>(&self) -> u64 {
        if INSERT {
            if self.zeros.swap(true, Ordering::Relaxed) {
                0
            } else {
                FRESH
            }
        } else if self.zeros.load(Ordering::Relaxed) {
            0
        } else {
            NOT_FOUND
        }
    }

    /// Occupancy snapshot. Scans the table; meant for reporting, not hot
    /// paths.
    pub fn stats(&self) -> TableStats {
        let used = self
            .cells()
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != 0)
            .count();
        TableStats {
            bytes_reserved: (self.mask as usize + 1) * 8,
            slots_used: used,
        }
    }

    /// Occupied-slot counts over `bars` equal regions of the table.
    pub fn density(&self, bars: usize) -> Vec<usize> {
        let buckets = self.mask as usize + 1;
        let per_bar = (buckets / bars).max(1);
        let cells = self.cells();
        let mut out = Vec::with_capacity(bars);
        let mut idx = 0;
        while idx < buckets {
            let end = (idx + per_bar).min(buckets);
            out.push(
                cells[idx..end]
                    .iter()
                    .filter(|c| c.load(Ordering::Relaxed) != 0)
                    .count(),
            );
            idx = end;
        }
        out
    }

    /// Extra probes needed to re-locate each resident key, attributed to
    /// the region of its home slot.
    pub fn probe_profile(&self, bars: usize) -> Vec<usize> {
        let buckets = self.mask as usize + 1;
        let per_bar = (buckets / bars).max(1);
        let cells = self.cells();
        let mut out = vec![0usize; buckets.div_ceil(per_bar)];
        for cell in cells.iter() {
            let key = cell.load(Ordering::Relaxed);
            if key != 0 {
                let mut ps = ProbeStats::default();
                self.find_tracked(key, &mut ps);
                out[ps.first_slot as usize / per_bar] += ps.probes - 1;
            }
        }
        out
    }
}

/// Lock-free interning set keyed on a 128-bit record, used for root nodes
/// that must remember their length.
///
/// Each cell is two adjacent 64-bit words: the pair word (CASed first,
/// nonzero once occupied) and the length word (published second, nonzero
/// once valid). Readers that observe an occupied pair word spin-yield
/// until the length word lands.
pub struct HashSet128<P: Prober = QuadLinear> {
    map: MmapMut,
    mask: u64,
    scale: u32,
    _probe: PhantomData<fn() -> P>,
}

impl<P: Prober> HashSet128<P> {
    /// Allocate a table of `2^scale` 16-byte cells.
    pub fn new(scale: u32) -> Self {
        check_scale(scale, 40);
        let buckets = 1usize << scale;
        Self {
            map: map_cells(buckets * 2),
            mask: buckets as u64 - 1,
            scale,
            _probe: PhantomData,
        }
    }

    /// Table capacity exponent.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    #[inline]
    fn cells(&self) -> &[AtomicU64] {
        cells(&self.map, 2 * (self.mask as usize + 1))
    }

    // A zero pair reads as an empty cell, so it is stored as all-ones with
    // the tag bit on the length word. Lengths are nonzero (the empty
    // vector is never interned), which is what lets readers spin on the
    // length word.
    #[inline]
    fn encode(pair: u64, length: u64) -> (u64, u64) {
        debug_assert!(length != 0 && length & ZERO_TAG == 0);
        if pair == 0 {
            (u64::MAX, length | ZERO_TAG)
        } else {
            (pair, length)
        }
    }

    #[inline]
    fn home(&self, hi: u64, lo: u64) -> u64 {
        (hi ^ lo) & self.mask
    }

    fn wait_low(lo: &AtomicU64) -> u64 {
        let mut spins = 0u32;
        loop {
            let v = lo.load(Ordering::Acquire);
            if v != 0 {
                return v;
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Find-or-insert of the record `(pair, length)`. Result encoding as
    /// in [`HashSet64::insert`].
    pub fn insert(&self, pair: u64, length: u64) -> u64 {
        self.search::<true>(pair, length)
    }

    /// Find only; [`NOT_FOUND`] when absent.
    pub fn find(&self, pair: u64, length: u64) -> u64 {
        self.search::<false>(pair, length)
    }

    fn search<const INSERT: bool>(&self, pair: u64, length: u64) -> u64 {
        let (hi, lo) = Self::encode(pair, length);
        let cells = self.cells();
        let mut slot = self.home(hi, lo);
        let mut prober = P::start(slot, self.mask);
        loop {
            if slot != 0 {
                let c_hi = &cells[2 * slot as usize];
                let c_lo = &cells[2 * slot as usize + 1];
                let cur = c_hi.load(Ordering::Relaxed);
                if cur == 0 {
                    if INSERT {
                        match c_hi.compare_exchange(0, hi, Ordering::Release, Ordering::Relaxed) {
                            Ok(_) => {
                                c_lo.store(lo, Ordering::Release);
                                return FRESH | slot;
                            }
                            Err(seen) => {
                                if seen == hi && Self::wait_low(c_lo) == lo {
                                    return slot;
                                }
                            }
                        }
                    } else {
                        return NOT_FOUND;
                    }
                } else if cur == hi && Self::wait_low(c_lo) == lo {
                    return slot;
                }
            }
            slot = match prober.next() {
                Some(s) => s,
                None => return NOT_FOUND,
            };
        }
    }

    /// The record stored at `slot`, decoded back to `(pair, length)`.
    /// Slot 0 reads as `(0, 0)`.
    #[inline]
    pub fn get(&self, slot: u64) -> (u64, u64) {
        let cells = self.cells();
        let hi = cells[2 * slot as usize].load(Ordering::Relaxed);
        let lo = cells[2 * slot as usize + 1].load(Ordering::Relaxed);
        if lo & ZERO_TAG != 0 {
            (hi.wrapping_add(1), lo & !ZERO_TAG)
        } else {
            (hi, lo)
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> TableStats {
        let cells = self.cells();
        let used = (0..=self.mask as usize)
            .filter(|&i| cells[2 * i].load(Ordering::Relaxed) != 0)
            .count();
        TableStats {
            bytes_reserved: (self.mask as usize + 1) * 16,
            slots_used: used,
        }
    }

    /// Occupied-slot counts over `bars` equal regions of the table.
    pub fn density(&self, bars: usize) -> Vec<usize> {
        let buckets = self.mask as usize + 1;
        let per_bar = (buckets / bars).max(1);
        let cells = self.cells();
        let mut out = Vec::with_capacity(bars);
        let mut idx = 0;
        while idx < buckets {
            let end = (idx + per_bar).min(buckets);
            out.push(
                (idx..end)
                    .filter(|&i| cells[2 * i].load(Ordering::Relaxed) != 0)
                    .count(),
            );
            idx = end;
        }
        out
    }
}
