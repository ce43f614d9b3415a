use std::sync::Mutex;

use crate::arena::Arena;
use crate::bits::{is_power_of_two, p2roundup};
use crate::error::{Error, Result};
use crate::l1::L1Layer;
use crate::l2::{L2Summary, L2_CHILD_ENTRIES};

/// A unit-aligned `(offset, length)` pair, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub offset: u64,
    pub length: u64,
}

impl Interval {
    pub fn new(offset: u64, length: u64) -> Interval {
        Interval { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Snapshot pages are carved out of the arena in chunks of at least
/// this many bytes.
pub(crate) const SNAPSHOT_PAGE: u64 = 0x8000;

/// Free-space manager over the arena: an L0 free bitmap, 2-bit L1
/// summaries per slotset and a 1-bit L2 guard per 256 L1 entries.
///
/// The allocator itself is volatile. Its content is reconstructed on
/// restart from the allocation log and the snapshot embedded in it.
pub struct BitmapAllocator {
    l1: L1Layer,
    l2: L2Summary,
    capacity: u64,
    unit: u64,
    alloc_count: u64,
    // serializes the L2 walk independently of the outer transaction
    // lock, as a seam for finer-grained locking later
    scan_lock: Mutex<()>,
}

impl BitmapAllocator {
    /// Build a fresh allocator over `capacity` bytes at `unit`
    /// granularity, with the first `reserved` bytes (the control
    /// block) marked allocated and excluded from accounting.
    pub fn new(capacity: u64, unit: u64, reserved: u64) -> BitmapAllocator {
        assert!(
            is_power_of_two(unit) && unit >= 16,
            "allocation unit must be a power of two >= 16"
        );
        assert!(
            capacity > 0 && capacity % unit == 0,
            "capacity must be a positive multiple of the unit"
        );
        assert!(reserved < capacity);

        let units = capacity / unit;
        let mut l1 = L1Layer::new(units, unit);
        let mut l2 = L2Summary::new(l1.entries());

        // round-up padding beyond the real capacity is never usable
        if units < l1.l0().total_bits() {
            l1.mark_allocated(units, l1.l0().total_bits());
        }
        if reserved > 0 {
            l1.mark_allocated(0, p2roundup(reserved, unit) / unit);
        }
        l2.refresh_over(&l1, 0, l1.entries());

        BitmapAllocator {
            l1,
            l2,
            capacity,
            unit,
            alloc_count: 0,
            scan_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn unit(&self) -> u64 {
        self.unit
    }

    /// Bytes summarized by one L1 entry, the contiguity ceiling for a
    /// single interval produced by the slotset-level search.
    pub fn l1_granularity(&self) -> u64 {
        self.l1.granularity()
    }

    /// Number of live allocations.
    pub fn alloc_count(&self) -> u64 {
        self.alloc_count
    }

    pub fn debug_free_bytes(&self) -> u64 {
        self.l1.debug_free_bytes()
    }

    /// Allocate intervals totalling between `min_length` and `length`
    /// bytes (both rounded up to units). Returns an empty list when
    /// the minimum cannot be met; nothing is held back in that case.
    ///
    /// The walk visits L2 regions in ascending order and within each
    /// region repeatedly takes the best slotset-level fit, so the
    /// lowest-offset satisfying space wins and adjacent pieces merge
    /// into one interval. Every piece of a stitched result honors
    /// `min_length`, except that a piece never needs to exceed the
    /// remaining want.
    pub fn alloc(&mut self, length: u64, min_length: u64) -> Vec<Interval> {
        assert!(length > 0, "zero-length allocation");
        assert!(min_length > 0 && min_length <= length);
        let length = p2roundup(length, self.unit);
        let min_length = p2roundup(min_length, self.unit);
        assert!(
            min_length <= self.l1.granularity(),
            "min_length above the slotset granularity is not supported"
        );

        let _guard = self.scan_lock.lock().unwrap();

        let mut res: Vec<Interval> = vec![];
        let mut allocated = 0;
        let gran = self.l1.granularity();
        let entries = self.l1.entries();

        'regions: for l2_pos in self.l2.set_positions() {
            let c0 = l2_pos * L2_CHILD_ENTRIES;
            let c1 = ((l2_pos + 1) * L2_CHILD_ENTRIES).min(entries);
            if c0 >= c1 {
                break;
            }
            loop {
                if allocated >= length {
                    break 'regions;
                }
                let want = (length - allocated).min(gran);
                let per_min = min_length.min(want);
                match self.l1.allocate_one(want, per_min, c0, c1) {
                    Some(iv) => {
                        allocated += iv.length;
                        match res.last_mut() {
                            Some(last) if last.end() == iv.offset => last.length += iv.length,
                            _ => res.push(iv),
                        }
                    }
                    None => break,
                }
            }
        }

        for iv in &res {
            let first = iv.offset / gran;
            let last = (iv.end() - 1) / gran;
            self.l2.refresh_over(&self.l1, first, last + 1);
        }

        if allocated < min_length {
            log::trace!(
                "allocation of {}..{} bytes failed with only {} stitchable",
                min_length,
                length,
                allocated
            );
            for iv in res.drain(..) {
                self.l1.release(iv);
                let first = iv.offset / gran;
                let last = (iv.end() - 1) / gran;
                self.l2.refresh_over(&self.l1, first, last + 1);
            }
            return vec![];
        }

        self.alloc_count += res.len() as u64;
        res
    }

    /// Allocate exactly `bytes` as one contiguous interval, or
    /// nothing. Fragmented space that cannot merge into a single
    /// interval is handed straight back.
    pub fn alloc_contiguous(&mut self, bytes: u64) -> Result<Interval> {
        let min = bytes.min(self.l1_granularity());
        let intervals = self.alloc(bytes, min);
        match intervals.len() {
            0 => Err(Error::OutOfSpace),
            1 if intervals[0].length >= bytes => Ok(intervals[0]),
            _ => {
                self.free(&intervals);
                Err(Error::OutOfSpace)
            }
        }
    }

    /// Release previously allocated intervals.
    pub fn free(&mut self, intervals: &[Interval]) {
        let _guard = self.scan_lock.lock().unwrap();
        for iv in intervals {
            self.check_span(*iv);
            let pos0 = iv.offset / self.unit;
            let pos1 = p2roundup(iv.end(), self.unit) / self.unit;
            assert_eq!(
                self.l1.l0().longest_free_run(pos0, pos1).len,
                0,
                "freeing an interval that is not fully allocated"
            );
            self.l1.release(*iv);
            let gran = self.l1.granularity();
            let first = iv.offset / gran;
            let last = (iv.end() - 1) / gran;
            self.l2.refresh_over(&self.l1, first, last + 1);
            assert!(self.alloc_count > 0);
            self.alloc_count -= 1;
        }
    }

    /// Re-mark an interval allocated during log replay. Idempotent on
    /// the bitmap; bumps the allocation count once.
    pub fn note_alloc(&mut self, iv: Interval) {
        self.check_span(iv);
        let pos0 = iv.offset / self.unit;
        let pos1 = p2roundup(iv.end(), self.unit) / self.unit;
        self.l1.mark_allocated(pos0, pos1);
        self.refresh_l2_for(iv);
        self.alloc_count += 1;
    }

    /// Re-mark an interval free during log replay or rollback undo.
    pub fn apply_release(&mut self, iv: Interval) {
        self.check_span(iv);
        let pos0 = iv.offset / self.unit;
        let pos1 = p2roundup(iv.end(), self.unit) / self.unit;
        self.l1.mark_released(pos0, pos1);
        self.refresh_l2_for(iv);
        assert!(self.alloc_count > 0);
        self.alloc_count -= 1;
    }

    fn check_span(&self, iv: Interval) {
        assert!(iv.length > 0);
        assert_eq!(iv.offset % self.unit, 0, "misaligned interval offset");
        assert!(iv.end() <= self.capacity, "interval out of range");
    }

    fn refresh_l2_for(&mut self, iv: Interval) {
        let gran = self.l1.granularity();
        let first = iv.offset / gran;
        let last = (iv.end() - 1) / gran;
        self.l2.refresh_over(&self.l1, first, last + 1);
    }

    /// Bytes needed to serialize the L0 bitmap. L1 and L2 are
    /// derivable and not captured.
    pub fn snapshot_bytes(&self) -> u64 {
        self.l1.l0().words().len() as u64 * 8
    }

    /// Serialize the L0 bitmap into the given arena pages and return
    /// the crc32 of the byte stream. The pages must already be
    /// allocated and total at least [`snapshot_bytes`](Self::snapshot_bytes).
    pub fn write_snapshot(&self, pages: &[Interval], arena: &Arena) -> u32 {
        let mut bytes = Vec::with_capacity(self.snapshot_bytes() as usize);
        for word in self.l1.l0().words() {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        let crc = crc32fast::hash(&bytes);

        let mut off = 0;
        for page in pages {
            if off == bytes.len() {
                break;
            }
            let n = (page.length as usize).min(bytes.len() - off);
            unsafe { arena.slice_mut(page.offset, n as u64) }
                .copy_from_slice(&bytes[off..off + n]);
            off += n;
        }
        assert_eq!(off, bytes.len(), "snapshot pages too small for the bitmap");
        crc
    }

    /// Restore the L0 bitmap from snapshot pages, re-derive the
    /// summaries and adopt the captured allocation count.
    pub fn apply_snapshot(
        &mut self,
        pages: &[Interval],
        alloc_count: u64,
        expected_crc: u32,
        arena: &Arena,
    ) -> Result<()> {
        let need = self.snapshot_bytes();
        let mut bytes = Vec::with_capacity(need as usize);
        for page in pages {
            if page.end() > self.capacity {
                return Err(Error::InconsistentReplay("snapshot page out of range"));
            }
            let src = unsafe { arena.slice(page.offset, page.length) };
            let take = src.len().min(need as usize - bytes.len());
            bytes.extend_from_slice(&src[..take]);
            if bytes.len() == need as usize {
                break;
            }
        }
        if bytes.len() != need as usize {
            return Err(Error::InconsistentReplay("snapshot truncated"));
        }
        if crc32fast::hash(&bytes) != expected_crc {
            return Err(Error::InconsistentReplay("snapshot crc mismatch"));
        }

        for (word, chunk) in self.l1.l0_mut().words_mut().iter_mut().zip(bytes.chunks(8)) {
            *word = u64::from_ne_bytes(chunk.try_into().unwrap());
        }
        let total = self.l1.l0().total_bits();
        self.l1.refresh_over(0, total);
        self.l2.refresh_over(&self.l1, 0, self.l1.entries());
        self.alloc_count = alloc_count;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const UNIT: u64 = 0x1000;
    const MB: u64 = 1024 * 1024;

    fn alloc1(a: &mut BitmapAllocator, length: u64, min_length: u64) -> Interval {
        let intervals = a.alloc(length, min_length);
        assert_eq!(intervals.len(), 1, "expected one interval: {:?}", intervals);
        intervals[0]
    }

    #[test]
    fn accounting_stays_balanced() {
        let capacity = 16 * MB;
        let mut a = BitmapAllocator::new(capacity, UNIT, 0);
        assert_eq!(a.debug_free_bytes(), capacity);

        let i1 = alloc1(&mut a, 3 * UNIT, UNIT);
        let i2 = alloc1(&mut a, MB, UNIT);
        assert_eq!(a.debug_free_bytes(), capacity - 3 * UNIT - MB);
        assert_eq!(a.alloc_count(), 2);

        a.free(&[i2, i1]);
        assert_eq!(a.debug_free_bytes(), capacity);
        assert_eq!(a.alloc_count(), 0);
    }

    #[test]
    fn reserved_region_is_withheld() {
        let capacity = 16 * MB;
        let a = BitmapAllocator::new(capacity, UNIT, 3 * UNIT);
        assert_eq!(a.debug_free_bytes(), capacity - 3 * UNIT);
        assert_eq!(a.alloc_count(), 0);
    }

    #[test]
    fn snapshot_roundtrip_is_identity() {
        let capacity = 16 * MB;
        let mut a = BitmapAllocator::new(capacity, UNIT, UNIT);
        let arena = Arena::new(capacity);

        let _i1 = alloc1(&mut a, 5 * UNIT, UNIT);
        let i2 = alloc1(&mut a, 2 * MB, UNIT);
        a.free(&[i2]);

        let need = a.snapshot_bytes().max(UNIT);
        let pages = a.alloc(need, need);
        assert!(!pages.is_empty());
        let crc = a.write_snapshot(&pages, &arena);

        let free_before = a.debug_free_bytes();
        let count_before = a.alloc_count();

        let mut b = BitmapAllocator::new(capacity, UNIT, UNIT);
        b.apply_snapshot(&pages, count_before, crc, &arena).unwrap();
        assert_eq!(b.debug_free_bytes(), free_before);
        assert_eq!(b.alloc_count(), count_before);

        // and the restored instance makes identical decisions
        let iv_a = a.alloc(3 * UNIT, UNIT);
        let iv_b = b.alloc(3 * UNIT, UNIT);
        assert_eq!(iv_a, iv_b);
    }

    #[test]
    fn bad_snapshot_crc_is_rejected() {
        let capacity = 16 * MB;
        let mut a = BitmapAllocator::new(capacity, UNIT, UNIT);
        let arena = Arena::new(capacity);
        let pages = a.alloc(a.snapshot_bytes().max(UNIT), UNIT);
        let crc = a.write_snapshot(&pages, &arena);
        let err = a
            .apply_snapshot(&pages, 0, crc ^ 1, &arena)
            .unwrap_err();
        assert_eq!(err, Error::InconsistentReplay("snapshot crc mismatch"));
    }

    #[test]
    #[should_panic(expected = "not fully allocated")]
    fn double_free_is_a_contract_violation() {
        let mut a = BitmapAllocator::new(16 * MB, UNIT, 0);
        let i1 = alloc1(&mut a, UNIT, UNIT);
        a.free(&[i1]);
        a.free(&[i1]);
    }
}
