use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::Interval;

/// The referenced header is a plain object cell.
pub(crate) const KIND_CELL: u64 = 0;
/// The referenced header is a unique-owned slot, which also restores
/// its pre-transaction length on recovery.
pub(crate) const KIND_SLOT: u64 = 1;

/// One duplicated header's pre-mutation identity.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjLogEntry {
    /// Arena offset of the mutated header.
    pub cell: u64,
    /// Transaction id the header carried before the mutation.
    pub tid: u64,
    /// Payload offset the header carried before the mutation.
    pub payload: u64,
    /// `KIND_CELL` or `KIND_SLOT`.
    pub kind: u64,
}

#[repr(C)]
struct OlogHeader {
    entries: u64,
    start: u64,
    end: u64,
}

const HEADER_BYTES: u64 = std::mem::size_of::<OlogHeader>() as u64;
const ENTRY_BYTES: u64 = std::mem::size_of::<ObjLogEntry>() as u64;

/// In-arena undo log of object headers duplicated by the open
/// transaction. Reset on commit, and on rollback after every entry
/// has been replayed.
#[derive(Clone, Copy)]
pub(crate) struct ObjectLog {
    region: Interval,
}

impl ObjectLog {
    pub fn required_bytes(entries: u64) -> u64 {
        HEADER_BYTES + entries * ENTRY_BYTES
    }

    /// Initialize a fresh log in `region`.
    pub fn format(arena: &Arena, region: Interval, entries: u64) -> ObjectLog {
        assert!(region.length >= Self::required_bytes(entries));
        let log = ObjectLog { region };
        let hdr = log.hdr_mut(arena);
        hdr.entries = entries;
        hdr.start = 0;
        hdr.end = 0;
        log
    }

    /// Adopt an existing log at `region`.
    pub fn open(arena: &Arena, region: Interval) -> Result<ObjectLog> {
        if region.offset == 0 || region.end() > arena.capacity() {
            return Err(Error::InconsistentReplay("object log handle out of range"));
        }
        let log = ObjectLog { region };
        let hdr = log.hdr(arena);
        if Self::required_bytes(hdr.entries) > region.length || hdr.end > hdr.entries {
            return Err(Error::InconsistentReplay("object log header corrupt"));
        }
        Ok(log)
    }

    fn hdr<'a>(&self, arena: &'a Arena) -> &'a OlogHeader {
        unsafe { &*arena.at::<OlogHeader>(self.region.offset) }
    }

    #[allow(clippy::mut_from_ref)]
    fn hdr_mut<'a>(&self, arena: &'a Arena) -> &'a mut OlogHeader {
        unsafe { &mut *arena.at::<OlogHeader>(self.region.offset) }
    }

    fn entry_offset(&self, index: u64) -> u64 {
        self.region.offset + HEADER_BYTES + index * ENTRY_BYTES
    }

    pub fn push(&self, arena: &Arena, entry: ObjLogEntry) -> Result<()> {
        let hdr = self.hdr_mut(arena);
        if hdr.end == hdr.entries {
            return Err(Error::LogFull);
        }
        unsafe {
            std::ptr::write(arena.at::<ObjLogEntry>(self.entry_offset(hdr.end)), entry);
        }
        hdr.end += 1;
        Ok(())
    }

    pub fn len(&self, arena: &Arena) -> u64 {
        let hdr = self.hdr(arena);
        hdr.end - hdr.start
    }

    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.len(arena) == 0
    }

    pub fn reset(&self, arena: &Arena) {
        let hdr = self.hdr_mut(arena);
        hdr.end = hdr.start;
    }

    /// Entries in push order.
    pub fn snapshot(&self, arena: &Arena) -> Vec<ObjLogEntry> {
        let hdr = self.hdr(arena);
        (hdr.start..hdr.end)
            .map(|i| unsafe { *arena.at::<ObjLogEntry>(self.entry_offset(i)) })
            .collect()
    }
}
