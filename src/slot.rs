use crate::arena::Arena;
use crate::cell::Persist;
use crate::error::Result;
use crate::root::{ReleaseCtx, Scope, Tx};
use crate::Interval;

/// A single-owner variant of the persistent object header: alongside
/// the `(tid, offset)` pair it records the exact byte length of the
/// owned payload, so destruction can free precisely what was
/// allocated. `prev_length` holds the pre-transaction length for
/// rollback.
///
/// The slot itself lives in the arena, embedded in some other
/// persistent structure.
#[repr(C)]
#[derive(Debug)]
pub struct PSlot {
    tid: u64,
    offset: u64,
    length: u64,
    prev_length: u64,
}

impl PSlot {
    pub const fn null() -> PSlot {
        PSlot {
            tid: 0,
            offset: 0,
            length: 0,
            prev_length: 0,
        }
    }

    pub(crate) fn raw(tid: u64, offset: u64, length: u64) -> PSlot {
        PSlot {
            tid,
            offset,
            length,
            prev_length: length,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Allocate a fresh payload of `bytes` and make this slot own it,
    /// releasing any previous payload transactionally.
    pub fn allocate_bytes(&mut self, tx: &Tx<'_>, bytes: u64) -> Result<()> {
        let offset = tx.alloc_raw(bytes)?;
        self.replace(tx, offset, bytes)
    }

    /// Allocate and construct a `T` in place as the new payload.
    pub fn allocate_obj<T: Persist>(&mut self, tx: &Tx<'_>, value: T) -> Result<()> {
        let bytes = std::mem::size_of::<T>() as u64;
        assert!(bytes > 0, "zero-sized slot payloads are not supported");
        let offset = tx.alloc_raw(bytes)?;
        unsafe { std::ptr::write(tx.arena().at::<T>(offset), value) };
        self.replace(tx, offset, bytes)
    }

    /// Install `(new_offset, new_length)` as the owned payload. On the
    /// first replacement of a transaction the old identity is pushed
    /// to the object log and the old payload queued for post-commit
    /// release; replacing again within the same transaction frees the
    /// intermediate payload immediately.
    pub fn replace(&mut self, tx: &Tx<'_>, new_offset: u64, new_length: u64) -> Result<()> {
        let tid = tx.id();
        if self.tid == tid {
            if self.offset != 0 {
                tx.free_raw(Interval::new(self.offset, self.length))?;
            }
        } else {
            let my_offset = tx.arena().offset_of(self as *const PSlot as *const u8);
            tx.log_slot(my_offset, self.tid, self.offset)?;
            self.prev_length = self.length;
            if self.offset != 0 {
                tx.queue_release(Interval::new(self.offset, self.length), None);
            }
            self.tid = tid;
        }
        self.offset = new_offset;
        self.length = new_length;
        Ok(())
    }

    /// Give up the payload: log the old identity on the transaction's
    /// first write of this slot, queue the exact recorded length for
    /// release and null the payload. The transaction id is kept so a
    /// later mutation in the same transaction neither re-logs the
    /// slot nor clobbers `prev_length`; the first entry stays
    /// authoritative for rollback.
    pub fn die(&mut self, tx: &Tx<'_>) -> Result<()> {
        if self.offset == 0 {
            return Ok(());
        }
        let tid = tx.id();
        if self.tid != tid {
            let my_offset = tx.arena().offset_of(self as *const PSlot as *const u8);
            tx.log_slot(my_offset, self.tid, self.offset)?;
            self.prev_length = self.length;
        }
        tx.queue_release(Interval::new(self.offset, self.length), None);
        self.tid = tid;
        self.offset = 0;
        self.length = 0;
        Ok(())
    }

    /// Read the payload as a `T`.
    pub fn inspect<'s, T, S: Scope>(&self, scope: &'s S) -> &'s T {
        assert!(!self.is_null(), "inspect of a null slot");
        assert!(self.length >= std::mem::size_of::<T>() as u64);
        unsafe { &*scope.arena().at::<T>(self.offset) }
    }

    /// Restore the pre-transaction identity recorded in the object
    /// log, including the owned length.
    pub(crate) fn recover_raw(arena: &Arena, slot_offset: u64, tid: u64, payload: u64) {
        let slot = unsafe { &mut *arena.at::<PSlot>(slot_offset) };
        slot.tid = tid;
        slot.offset = payload;
        slot.length = slot.prev_length;
    }
}

// A slot owns its payload uniquely, so duplicating the containing
// record deep-copies the payload rather than sharing it.
unsafe impl Persist for PSlot {
    fn duplicate(&self, tx: &Tx<'_>) -> Result<PSlot> {
        if self.is_null() {
            return Ok(PSlot::null());
        }
        let offset = tx.alloc_raw(self.length)?;
        let arena = tx.arena();
        unsafe {
            std::ptr::copy_nonoverlapping(
                arena.ptr_at(self.offset),
                arena.ptr_at(offset),
                self.length as usize,
            );
        }
        Ok(PSlot::raw(tx.id(), offset, self.length))
    }

    fn retire(&self, ctx: &mut ReleaseCtx<'_>) {
        if !self.is_null() {
            ctx.queue(Interval::new(self.offset, self.length), None);
        }
    }
}
