use crate::allocator::{BitmapAllocator, SNAPSHOT_PAGE};
use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::slot::PSlot;
use crate::Interval;

pub(crate) const FLAG_ALLOC: u32 = 0;
pub(crate) const FLAG_RELEASE: u32 = 1;
pub(crate) const FLAG_INIT: u32 = 2;

/// One allocator mutation. An INIT marker reuses `(offset, length)`
/// as `(capacity, unit)`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogEntry {
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

impl LogEntry {
    pub fn alloc(iv: Interval) -> LogEntry {
        LogEntry {
            offset: iv.offset,
            length: u32::try_from(iv.length).expect("allocation exceeds the log entry width"),
            flags: FLAG_ALLOC,
        }
    }

    pub fn release(iv: Interval) -> LogEntry {
        LogEntry {
            length: u32::try_from(iv.length).expect("allocation exceeds the log entry width"),
            offset: iv.offset,
            flags: FLAG_RELEASE,
        }
    }

    pub fn init(capacity: u64, unit: u64) -> LogEntry {
        LogEntry {
            offset: capacity,
            length: u32::try_from(unit).expect("unit exceeds the log entry width"),
            flags: FLAG_INIT,
        }
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.offset, self.length as u64)
    }

    pub fn is_release(&self) -> bool {
        self.flags == FLAG_RELEASE
    }

    pub fn is_init(&self) -> bool {
        self.flags == FLAG_INIT
    }
}

#[repr(C)]
struct AlogHeader {
    entries: u64,
    start: u64,
    stable: u64,
    head: u64,
    base_alloc_count: u64,
    snapshot_list: PSlot,
    snapshot_page_count: u64,
    snapshot_alloc_count: u64,
    snapshot_crc: u32,
    _pad: u32,
}

const HEADER_BYTES: u64 = std::mem::size_of::<AlogHeader>() as u64;
const ENTRY_BYTES: u64 = std::mem::size_of::<LogEntry>() as u64;

/// The persistent allocation log: an in-arena FIFO of allocator
/// mutations with cursors `start <= stable <= head`. Entries in
/// `[start, stable)` belong to committed state; `[stable, head)` is
/// the in-flight transaction's tail.
#[derive(Clone, Copy)]
pub(crate) struct AllocationLog {
    region: Interval,
}

impl AllocationLog {
    pub fn required_bytes(entries: u64) -> u64 {
        HEADER_BYTES + entries * ENTRY_BYTES
    }

    pub fn format(arena: &Arena, region: Interval, entries: u64) -> AllocationLog {
        assert!(region.length >= Self::required_bytes(entries));
        let log = AllocationLog { region };
        let hdr = log.hdr_mut(arena);
        hdr.entries = entries;
        hdr.start = 0;
        hdr.stable = 0;
        hdr.head = 0;
        hdr.base_alloc_count = 0;
        hdr.snapshot_list = PSlot::null();
        hdr.snapshot_page_count = 0;
        hdr.snapshot_alloc_count = 0;
        hdr.snapshot_crc = 0;
        log
    }

    pub fn open(arena: &Arena, region: Interval) -> Result<AllocationLog> {
        if region.offset == 0 || region.end() > arena.capacity() {
            return Err(Error::InconsistentReplay("allocation log handle out of range"));
        }
        let log = AllocationLog { region };
        let hdr = log.hdr(arena);
        if hdr.entries == 0
            || Self::required_bytes(hdr.entries) > region.length
            || hdr.start > hdr.stable
            || hdr.stable > hdr.head
            || hdr.head > hdr.entries
        {
            return Err(Error::InconsistentReplay("allocation log header corrupt"));
        }
        Ok(log)
    }

    pub fn region(&self) -> Interval {
        self.region
    }

    fn hdr<'a>(&self, arena: &'a Arena) -> &'a AlogHeader {
        unsafe { &*arena.at::<AlogHeader>(self.region.offset) }
    }

    #[allow(clippy::mut_from_ref)]
    fn hdr_mut<'a>(&self, arena: &'a Arena) -> &'a mut AlogHeader {
        unsafe { &mut *arena.at::<AlogHeader>(self.region.offset) }
    }

    fn entry_offset(&self, index: u64) -> u64 {
        self.region.offset + HEADER_BYTES + index * ENTRY_BYTES
    }

    pub fn entry(&self, arena: &Arena, index: u64) -> LogEntry {
        debug_assert!(index < self.hdr(arena).head);
        unsafe { *arena.at::<LogEntry>(self.entry_offset(index)) }
    }

    pub fn append(&self, arena: &Arena, entry: LogEntry) -> Result<()> {
        let hdr = self.hdr_mut(arena);
        if hdr.head == hdr.entries {
            return Err(Error::LogFull);
        }
        unsafe {
            std::ptr::write(arena.at::<LogEntry>(self.entry_offset(hdr.head)), entry);
        }
        hdr.head += 1;
        Ok(())
    }

    /// Make the tail part of committed state.
    pub fn commit(&self, arena: &Arena) {
        let hdr = self.hdr_mut(arena);
        hdr.stable = hdr.head;
    }

    /// Discard the uncommitted tail.
    pub fn rollback(&self, arena: &Arena) {
        let hdr = self.hdr_mut(arena);
        hdr.head = hdr.stable;
    }

    pub fn is_committed(&self, arena: &Arena) -> bool {
        let hdr = self.hdr(arena);
        hdr.stable == hdr.head
    }

    pub fn size(&self, arena: &Arena) -> u64 {
        let hdr = self.hdr(arena);
        hdr.head - hdr.start
    }

    /// Committed entries, `[start, stable)`, in append order.
    pub fn committed(&self, arena: &Arena) -> Vec<LogEntry> {
        let hdr = self.hdr(arena);
        (hdr.start..hdr.stable).map(|i| self.entry(arena, i)).collect()
    }

    /// The in-flight tail, `[stable, head)`, in append order.
    pub fn uncommitted(&self, arena: &Arena) -> Vec<LogEntry> {
        let hdr = self.hdr(arena);
        (hdr.stable..hdr.head).map(|i| self.entry(arena, i)).collect()
    }

    pub fn has_snapshot(&self, arena: &Arena) -> bool {
        self.hdr(arena).snapshot_page_count > 0
    }

    pub fn snapshot_alloc_count(&self, arena: &Arena) -> u64 {
        self.hdr(arena).snapshot_alloc_count
    }

    pub fn snapshot_crc(&self, arena: &Arena) -> u32 {
        self.hdr(arena).snapshot_crc
    }

    /// The snapshot page list recorded at squeeze time.
    pub fn snapshot_pages(&self, arena: &Arena) -> Result<Vec<Interval>> {
        let hdr = self.hdr(arena);
        let list = &hdr.snapshot_list;
        let count = hdr.snapshot_page_count;
        if list.is_null() || list.length() < count * ENTRY_BYTES {
            return Err(Error::InconsistentReplay("snapshot page list corrupt"));
        }
        let mut pages = Vec::with_capacity(count as usize);
        for i in 0..count {
            let e = unsafe { *arena.at::<LogEntry>(list.offset() + i * ENTRY_BYTES) };
            let iv = e.interval();
            if iv.length == 0 || iv.end() > arena.capacity() {
                return Err(Error::InconsistentReplay("snapshot page out of range"));
            }
            pages.push(iv);
        }
        Ok(pages)
    }

    /// Every arena region this log owns: its own storage, plus the
    /// snapshot page list and pages when present.
    pub fn owned_regions(&self, arena: &Arena) -> Result<Vec<Interval>> {
        let mut regions = vec![self.region];
        if self.has_snapshot(arena) {
            regions.extend(self.snapshot_pages(arena)?);
            let list = &self.hdr(arena).snapshot_list;
            regions.push(Interval::new(list.offset(), list.length()));
        }
        Ok(regions)
    }

    /// Replace this log with a fresh one seeded from a bitmap
    /// snapshot: the new log carries the INIT marker as entry zero,
    /// the serialized L0 image (captured after the squeeze's own
    /// allocations so it self-describes them), and RELEASE entries
    /// for every region the old log owned. Returns the new log and
    /// the old regions, which the caller frees after switching the
    /// owning handle.
    pub fn squeeze(
        &self,
        arena: &Arena,
        alloc: &mut BitmapAllocator,
        tid: u64,
    ) -> Result<(AllocationLog, Vec<Interval>)> {
        let first = self.entry(arena, 0);
        assert!(first.is_init(), "allocation log must begin with an init marker");

        let old_regions = self.owned_regions(arena)?;
        let entries = self.hdr(arena).entries;
        if 1 + old_regions.len() as u64 > entries {
            return Err(Error::LogFull);
        }

        let count0 = alloc.alloc_count();

        let new_region = alloc.alloc_contiguous(Self::required_bytes(entries))?;

        let snap_need = alloc.snapshot_bytes();
        let pages = alloc.alloc(snap_need, SNAPSHOT_PAGE.min(snap_need));
        if pages.iter().map(|p| p.length).sum::<u64>() < snap_need {
            alloc.free(&pages);
            alloc.free(&[new_region]);
            return Err(Error::OutOfSpace);
        }

        let list_region = match alloc.alloc_contiguous(pages.len() as u64 * ENTRY_BYTES) {
            Ok(region) => region,
            Err(e) => {
                alloc.free(&pages);
                alloc.free(&[new_region]);
                return Err(e);
            }
        };

        let new = Self::format(arena, new_region, entries);
        for (i, page) in pages.iter().enumerate() {
            unsafe {
                std::ptr::write(
                    arena.at::<LogEntry>(list_region.offset + i as u64 * ENTRY_BYTES),
                    LogEntry::alloc(*page),
                );
            }
        }
        {
            let hdr = new.hdr_mut(arena);
            hdr.snapshot_list = PSlot::raw(tid, list_region.offset, list_region.length);
            hdr.snapshot_page_count = pages.len() as u64;
        }
        new.append(arena, first).expect("fresh log cannot be full");

        // capture with the new log, pages and list already allocated
        // and the old regions still live, so that the RELEASE entries
        // below replay against exactly this image
        let crc = alloc.write_snapshot(&pages, arena);
        {
            let hdr = new.hdr_mut(arena);
            hdr.snapshot_crc = crc;
            hdr.snapshot_alloc_count = alloc.alloc_count();
            hdr.base_alloc_count = alloc.alloc_count() - count0;
        }

        for region in &old_regions {
            new.append(arena, LogEntry::release(*region))
                .expect("entry capacity was checked above");
        }
        new.commit(arena);

        log::debug!(
            "squeezed allocation log from {} entries down to {}",
            self.size(arena),
            new.size(arena),
        );

        Ok((new, old_regions))
    }
}
