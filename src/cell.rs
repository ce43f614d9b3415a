use std::marker::PhantomData;

use crate::error::Result;
use crate::root::{ReleaseCtx, Scope, Tx};
use crate::Interval;

/// Implemented by every type stored as a transactional payload in the
/// arena.
///
/// # Safety
///
/// Implementations must be position independent: no native pointers,
/// references or heap handles, only plain data, offsets, and other
/// `Persist` values. `duplicate` must produce a deep copy whose owned
/// arena buffers are freshly allocated through `tx`, and `retire`
/// must queue exactly the buffers the value owns.
pub unsafe trait Persist: Sized {
    /// Deep-copy this value through the transactional allocator.
    fn duplicate(&self, tx: &Tx<'_>) -> Result<Self>;

    /// Queue owned arena buffers for post-commit release. Objects
    /// referenced through [`PRef`] members are not owned and must be
    /// destroyed explicitly with [`PRef::die`].
    fn retire(&self, ctx: &mut ReleaseCtx<'_>);
}

macro_rules! plain_persist {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Persist for $t {
                fn duplicate(&self, _: &Tx<'_>) -> Result<Self> {
                    Ok(*self)
                }

                fn retire(&self, _: &mut ReleaseCtx<'_>) {}
            }
        )*
    };
}

plain_persist!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char, f32, f64);

unsafe impl<T: Persist + Copy, const N: usize> Persist for [T; N] {
    fn duplicate(&self, _: &Tx<'_>) -> Result<Self> {
        Ok(*self)
    }

    fn retire(&self, _: &mut ReleaseCtx<'_>) {}
}

/// The in-arena header of a persistent object: the id of the
/// transaction that last wrote it and the offset of the owned
/// payload. `(0, 0)` is the dead state.
#[repr(C)]
pub(crate) struct CellHeader {
    pub tid: u64,
    pub payload: u64,
}

pub(crate) const CELL_BYTES: u64 = std::mem::size_of::<CellHeader>() as u64;

/// A typed reference to a persistent object: the arena offset of its
/// [`CellHeader`]. References are plain values; they may be stored
/// inside other persistent objects and copied freely. The object
/// itself is destroyed only by an explicit [`die`](Self::die).
#[repr(C)]
pub struct PRef<T> {
    cell: u64,
    _pd: PhantomData<*const T>,
}

impl<T> Clone for PRef<T> {
    fn clone(&self) -> PRef<T> {
        *self
    }
}

impl<T> Copy for PRef<T> {}

impl<T> PartialEq for PRef<T> {
    fn eq(&self, other: &PRef<T>) -> bool {
        self.cell == other.cell
    }
}

impl<T> Eq for PRef<T> {}

impl<T> std::fmt::Debug for PRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PRef").field(&self.cell).finish()
    }
}

impl<T> PRef<T> {
    pub const fn null() -> PRef<T> {
        PRef {
            cell: 0,
            _pd: PhantomData,
        }
    }

    pub(crate) fn from_cell(cell: u64) -> PRef<T> {
        PRef {
            cell,
            _pd: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.cell == 0
    }
}

impl<T: Persist> PRef<T> {
    /// Read-only access to the payload.
    ///
    /// Multiple shared borrows may be live at once; the caller must
    /// not hold one across a mutation of the same object.
    pub fn inspect<'s, S: Scope>(&self, scope: &'s S) -> &'s T {
        assert!(!self.is_null(), "inspect of a null reference");
        let arena = scope.arena();
        let hdr = unsafe { &*arena.at::<CellHeader>(self.cell) };
        assert!(hdr.tid != 0 && hdr.payload != 0, "inspect of a dead object");
        unsafe { &*arena.at::<T>(hdr.payload) }
    }

    /// Writable access to the payload, duplicating it on the first
    /// write of the transaction: the copy becomes the payload, the
    /// pre-mutation identity goes to the object log, and the old
    /// payload is queued for destruction at commit.
    ///
    /// The caller must not hold two live mutable borrows of the same
    /// object; the exclusive transaction guard serializes writers but
    /// cannot see aliasing through distinct `PRef` copies.
    pub fn access<'s>(&self, tx: &'s Tx<'_>) -> Result<&'s mut T> {
        assert!(!self.is_null(), "access of a null reference");
        let arena = tx.arena();
        let hdr = unsafe { &mut *arena.at::<CellHeader>(self.cell) };
        assert!(hdr.tid != 0 && hdr.payload != 0, "access of a dead object");

        let tid = tx.id();
        if hdr.tid == tid {
            return Ok(unsafe { &mut *arena.at::<T>(hdr.payload) });
        }

        let dup = unsafe { &*arena.at::<T>(hdr.payload) }.duplicate(tx)?;
        let fresh = tx.alloc_raw(std::mem::size_of::<T>() as u64)?;
        tx.log_cell(self.cell, hdr.tid, hdr.payload)?;
        tx.queue_release(
            Interval::new(hdr.payload, std::mem::size_of::<T>() as u64),
            Some(retire_thunk::<T>),
        );
        unsafe { std::ptr::write(arena.at::<T>(fresh), dup) };
        hdr.tid = tid;
        hdr.payload = fresh;
        Ok(unsafe { &mut *arena.at::<T>(fresh) })
    }

    /// Destroy the object: log the pre-mutation identity for
    /// rollback, queue both payload and header for destruction at
    /// commit, and zero the header in place.
    pub fn die(&self, tx: &Tx<'_>) -> Result<()> {
        assert!(!self.is_null(), "die of a null reference");
        let arena = tx.arena();
        let hdr = unsafe { &mut *arena.at::<CellHeader>(self.cell) };
        assert!(hdr.tid != 0 && hdr.payload != 0, "die of a dead object");

        // the object log holds one pre-transaction identity per
        // header; a header this transaction already wrote is covered
        // by that first entry
        if hdr.tid != tx.id() {
            tx.log_cell(self.cell, hdr.tid, hdr.payload)?;
        }
        tx.queue_release(
            Interval::new(hdr.payload, std::mem::size_of::<T>() as u64),
            Some(retire_thunk::<T>),
        );
        tx.queue_release(Interval::new(self.cell, CELL_BYTES), None);
        hdr.tid = 0;
        hdr.payload = 0;
        Ok(())
    }
}

// Object references are plain values: copying one never duplicates
// or frees the referent.
unsafe impl<T> Persist for PRef<T> {
    fn duplicate(&self, _: &Tx<'_>) -> Result<Self> {
        Ok(*self)
    }

    fn retire(&self, _: &mut ReleaseCtx<'_>) {}
}

/// Type-erased destructor recorded with queued payloads so that
/// heterogeneous objects can be destroyed in sequence at commit.
pub(crate) unsafe fn retire_thunk<T: Persist>(offset: u64, ctx: &mut ReleaseCtx<'_>) {
    let value: &T = &*ctx.arena().at::<T>(offset);
    value.retire(ctx);
}

/// Restore a cell's pre-mutation identity during rollback or replay.
pub(crate) fn recover_raw(arena: &crate::arena::Arena, cell: u64, tid: u64, payload: u64) {
    let hdr = unsafe { &mut *arena.at::<CellHeader>(cell) };
    hdr.tid = tid;
    hdr.payload = payload;
}
