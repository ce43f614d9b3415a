use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::alloc_log::{AllocationLog, LogEntry, FLAG_ALLOC, FLAG_RELEASE, FLAG_INIT};
use crate::allocator::BitmapAllocator;
use crate::arena::Arena;
use crate::bits::p2roundup;
use crate::cell::{self, CellHeader, PRef, Persist, CELL_BYTES};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::obj_log::{ObjLogEntry, ObjectLog, KIND_CELL, KIND_SLOT};
use crate::slot::PSlot;
use crate::vcell;
use crate::Interval;

const MAGIC: u64 = 0x6167_6174_655f_7472; // "agate_tr"
const VERSION: u64 = 1;

/// The control block at arena offset 0. Everything else persistent is
/// reached from here: the two transaction ids and the handles of the
/// two logs.
#[repr(C)]
struct RootHeader {
    magic: u64,
    version: u64,
    id_stable: AtomicU64,
    id_next: AtomicU64,
    capacity: u64,
    unit: u64,
    alog_offset: u64,
    alog_length: u64,
    olog_offset: u64,
    olog_length: u64,
}

fn reserved_bytes(unit: u64) -> u64 {
    p2roundup(std::mem::size_of::<RootHeader>() as u64, unit)
}

/// Destructor callback recorded with a queued region so that
/// heterogeneous payloads can be destroyed in sequence at commit.
pub type RetireFn = unsafe fn(u64, &mut ReleaseCtx<'_>);

/// One deferred destruction task. A zero-length region runs its
/// retire callback without freeing anything, for values embedded in
/// larger regions.
#[derive(Clone, Copy)]
pub(crate) struct ReleaseTask {
    region: Interval,
    retire: Option<RetireFn>,
}

/// Passed to [`Persist::retire`] while the release queue drains at
/// commit. Retiring a value may queue further regions; the drain
/// picks them up in order.
pub struct ReleaseCtx<'a> {
    arena: &'a Arena,
    queue: &'a mut Vec<ReleaseTask>,
}

impl ReleaseCtx<'_> {
    pub(crate) fn arena(&self) -> &Arena {
        self.arena
    }

    /// Queue a region for release, optionally with a destructor for
    /// the value stored there.
    pub fn queue(&mut self, region: Interval, retire: Option<RetireFn>) {
        self.queue.push(ReleaseTask { region, retire });
    }
}

/// A context that can resolve persistent offsets: an open transaction
/// or a read guard.
pub trait Scope {
    #[doc(hidden)]
    fn arena(&self) -> &Arena;
}

struct RootState {
    allocator: Option<BitmapAllocator>,
    alog: Option<AllocationLog>,
    olog: Option<ObjectLog>,
    release_queue: Vec<ReleaseTask>,
    squeeze_threshold: u64,
}

/// The transactional object manager: owns the arena, the allocator,
/// both logs and the release queue, and hands out transaction and
/// read guards against a shared-exclusive lock.
pub struct TransactionRoot {
    arena: Arena,
    state: RwLock<RootState>,
}

impl TransactionRoot {
    /// Allocate a virgin arena of `capacity` bytes. The root is inert
    /// until [`prepare`](Self::prepare) formats it.
    pub fn create(capacity: u64) -> TransactionRoot {
        TransactionRoot {
            arena: Arena::new(capacity),
            state: RwLock::new(RootState {
                allocator: None,
                alog: None,
                olog: None,
                release_queue: vec![],
                squeeze_threshold: 0,
            }),
        }
    }

    fn header(&self) -> &RootHeader {
        unsafe { &*self.arena.at::<RootHeader>(0) }
    }

    /// Callers must hold the write lock and be the only mutator of
    /// the non-atomic header fields.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut RootHeader {
        &mut *self.arena.at::<RootHeader>(0)
    }

    /// Format the arena: init the allocator with the control block
    /// reserved, allocate both logs, and seed the allocation log with
    /// the INIT marker plus entries covering the log storage itself,
    /// so replay can rebuild everything from the log alone.
    pub fn prepare(&self, config: Config) -> Result<()> {
        config.validate();
        assert_eq!(
            config.capacity,
            self.arena.capacity(),
            "configured capacity must match the arena"
        );

        let mut st = self.state.write().unwrap();
        assert!(st.allocator.is_none(), "prepare on an active root");
        assert_eq!(
            self.header().magic,
            0,
            "prepare on a formatted arena; use restart to recover it"
        );

        let reserved = reserved_bytes(config.min_alloc_unit);
        let mut allocator =
            BitmapAllocator::new(config.capacity, config.min_alloc_unit, reserved);

        let alog_region =
            allocator.alloc_contiguous(AllocationLog::required_bytes(config.alloc_log_entries))?;
        let olog_region =
            allocator.alloc_contiguous(ObjectLog::required_bytes(config.obj_log_entries))?;
        let alog = AllocationLog::format(&self.arena, alog_region, config.alloc_log_entries);
        let olog = ObjectLog::format(&self.arena, olog_region, config.obj_log_entries);

        alog.append(
            &self.arena,
            LogEntry::init(config.capacity, config.min_alloc_unit),
        )
        .expect("fresh log cannot be full");
        alog.append(&self.arena, LogEntry::alloc(alog_region))
            .expect("fresh log cannot be full");
        alog.append(&self.arena, LogEntry::alloc(olog_region))
            .expect("fresh log cannot be full");
        alog.commit(&self.arena);

        let hdr = unsafe { self.header_mut() };
        hdr.id_stable.store(1, SeqCst);
        hdr.id_next.store(1, SeqCst);
        hdr.capacity = config.capacity;
        hdr.unit = config.min_alloc_unit;
        hdr.alog_offset = alog_region.offset;
        hdr.alog_length = alog_region.length;
        hdr.olog_offset = olog_region.offset;
        hdr.olog_length = olog_region.length;
        hdr.version = VERSION;
        hdr.magic = MAGIC;

        st.allocator = Some(allocator);
        st.alog = Some(alog);
        st.olog = Some(olog);
        st.squeeze_threshold = config.squeeze_threshold;

        log::debug!(
            "prepared {} byte arena at unit {}",
            config.capacity,
            config.min_alloc_unit
        );
        Ok(())
    }

    /// Simulate a process restart: every volatile structure is thrown
    /// away, volatile handles are invalidated, and the persisted logs
    /// are replayed to reconstruct the last committed state.
    pub fn restart(&self) -> Result<()> {
        let mut st = self.state.write().unwrap();
        vcell::bump_run_id();
        st.release_queue.clear();
        st.allocator = None;
        st.alog = None;
        st.olog = None;
        log::debug!("restarting: replaying persisted state");
        self.replay_locked(&mut st)
    }

    /// Drop the volatile state without touching the arena. The root
    /// can be revived with [`restart`](Self::restart).
    pub fn shutdown(&self) {
        let mut st = self.state.write().unwrap();
        st.release_queue.clear();
        st.allocator = None;
        st.alog = None;
        st.olog = None;
    }

    /// Open a writer transaction. Takes the lock exclusively; the
    /// guard rolls back on drop unless committed.
    pub fn start_transaction(&self) -> Tx<'_> {
        let st = self.state.write().unwrap();
        assert!(st.allocator.is_some(), "root is not prepared");
        let alog = st.alog.expect("root is not prepared");
        assert!(alog.is_committed(&self.arena));
        assert!(st.olog.expect("root is not prepared").is_empty(&self.arena));

        let hdr = self.header();
        let next = hdr.id_stable.load(SeqCst) + 1;
        hdr.id_next.store(next, SeqCst);
        log::trace!("transaction {} open", next);

        Tx {
            root: self,
            state: RefCell::new(st),
            done: Cell::new(false),
        }
    }

    /// Open a shared read guard. Readers see the most recently
    /// committed state and never a partially applied transaction.
    pub fn start_read_access(&self) -> ReadAccess<'_> {
        let guard = self.state.read().unwrap();
        assert!(guard.allocator.is_some(), "root is not prepared");
        ReadAccess {
            root: self,
            _guard: guard,
        }
    }

    /// Number of live allocations, objects and buffers alike.
    pub fn object_count(&self) -> u64 {
        let st = self.state.read().unwrap();
        st.allocator
            .as_ref()
            .expect("root is not prepared")
            .alloc_count()
    }

    /// Free bytes remaining in the arena.
    pub fn available_bytes(&self) -> u64 {
        let st = self.state.read().unwrap();
        st.allocator
            .as_ref()
            .expect("root is not prepared")
            .debug_free_bytes()
    }

    /// Entries currently held in the allocation log.
    pub fn alloc_log_size(&self) -> u64 {
        let st = self.state.read().unwrap();
        st.alog.expect("root is not prepared").size(&self.arena)
    }

    /// Id of the last committed transaction.
    pub fn stable_id(&self) -> u64 {
        self.header().id_stable.load(SeqCst)
    }

    /// Id labeling in-flight writes; above `stable_id` iff a
    /// transaction is open.
    pub fn in_flight_id(&self) -> u64 {
        self.header().id_next.load(SeqCst)
    }

    fn replay_locked(&self, st: &mut RootState) -> Result<()> {
        let arena = &self.arena;
        let hdr = self.header();
        if hdr.magic != MAGIC || hdr.version != VERSION {
            return Err(Error::InconsistentReplay("arena is not a formatted root"));
        }
        if hdr.capacity != arena.capacity() {
            return Err(Error::InconsistentReplay("header capacity mismatch"));
        }

        let alog = AllocationLog::open(arena, Interval::new(hdr.alog_offset, hdr.alog_length))?;
        let olog = ObjectLog::open(arena, Interval::new(hdr.olog_offset, hdr.olog_length))?;

        let id_stable = hdr.id_stable.load(SeqCst);
        let id_next = hdr.id_next.load(SeqCst);
        if id_next > id_stable {
            log::debug!(
                "replay found interrupted transaction {}, rolling it back",
                id_next
            );
            for entry in olog.snapshot(arena) {
                apply_recovery(arena, entry)?;
            }
            olog.reset(arena);
            alog.rollback(arena);
            hdr.id_next.store(id_stable, SeqCst);
        } else {
            if id_next < id_stable {
                return Err(Error::InconsistentReplay("transaction ids regressed"));
            }
            // a crash can land between the stable-id advance and the
            // log commit; with matching ids the tail is committed work
            alog.commit(arena);
            olog.reset(arena);
        }

        let entries = alog.committed(arena);
        let mut allocator: Option<BitmapAllocator> = None;
        for (i, entry) in entries.iter().enumerate() {
            match entry.flags {
                FLAG_INIT => {
                    if i != 0 {
                        return Err(Error::InconsistentReplay("unexpected init entry"));
                    }
                    let capacity = entry.offset;
                    let unit = entry.length as u64;
                    if capacity != hdr.capacity || unit != hdr.unit {
                        return Err(Error::InconsistentReplay(
                            "init entry disagrees with the root header",
                        ));
                    }
                    let mut fresh = BitmapAllocator::new(capacity, unit, reserved_bytes(unit));
                    if alog.has_snapshot(arena) {
                        let pages = alog.snapshot_pages(arena)?;
                        fresh.apply_snapshot(
                            &pages,
                            alog.snapshot_alloc_count(arena),
                            alog.snapshot_crc(arena),
                            arena,
                        )?;
                    }
                    allocator = Some(fresh);
                }
                FLAG_RELEASE | FLAG_ALLOC => {
                    let a = allocator
                        .as_mut()
                        .ok_or(Error::InconsistentReplay("log entry before init"))?;
                    let iv = entry.interval();
                    if iv.end() > hdr.capacity {
                        return Err(Error::InconsistentReplay("log entry out of range"));
                    }
                    if entry.is_release() {
                        a.apply_release(iv);
                    } else {
                        a.note_alloc(iv);
                    }
                }
                _ => return Err(Error::InconsistentReplay("unknown log entry flag")),
            }
        }

        let allocator =
            allocator.ok_or(Error::InconsistentReplay("log carries no init entry"))?;
        log::debug!(
            "replayed {} log entries, {} live allocations, {} bytes free",
            entries.len(),
            allocator.alloc_count(),
            allocator.debug_free_bytes()
        );
        st.allocator = Some(allocator);
        st.alog = Some(alog);
        st.olog = Some(olog);
        Ok(())
    }

    fn commit_locked(&self, st: &mut RootState) -> Result<()> {
        let arena = &self.arena;

        // drain by index: destructors may queue further tasks behind
        // the cursor while the queue is walked
        let mut i = 0;
        while i < st.release_queue.len() {
            let task = st.release_queue[i];
            i += 1;

            if let Some(retire) = task.retire {
                let mut ctx = ReleaseCtx {
                    arena,
                    queue: &mut st.release_queue,
                };
                unsafe { retire(task.region.offset, &mut ctx) };
            }
            if task.region.length == 0 {
                continue;
            }

            let allocator = st.allocator.as_mut().unwrap();
            let rounded = Interval::new(
                task.region.offset,
                p2roundup(task.region.length, allocator.unit()),
            );
            let alog = st.alog.as_ref().unwrap();
            if alog.append(arena, LogEntry::release(rounded)).is_err() {
                log::warn!("allocation log filled during commit, aborting the transaction");
                return Err(Error::OutOfSpace);
            }
            allocator.free(&[rounded]);
        }
        st.release_queue.clear();

        let hdr = self.header();
        let next = hdr.id_next.load(SeqCst);
        hdr.id_stable.store(next, SeqCst);
        let alog = st.alog.unwrap();
        alog.commit(arena);
        st.olog.unwrap().reset(arena);
        log::trace!("transaction {} committed", next);

        if alog.size(arena) > st.squeeze_threshold {
            let allocator = st.allocator.as_mut().unwrap();
            match alog.squeeze(arena, allocator, next) {
                Ok((new_log, old_regions)) => {
                    let hdr = unsafe { self.header_mut() };
                    hdr.alog_offset = new_log.region().offset;
                    hdr.alog_length = new_log.region().length;
                    st.alog = Some(new_log);
                    st.allocator.as_mut().unwrap().free(&old_regions);
                }
                Err(e) => log::warn!("allocation log squeeze skipped: {}", e),
            }
        }

        Ok(())
    }

    /// Infallible by design: undo the uncommitted allocation-log tail
    /// in reverse (an exact inverse of each entry), then replay the
    /// object log in order to restore every duplicated header.
    fn rollback_locked(&self, st: &mut RootState) {
        let arena = &self.arena;
        st.release_queue.clear();

        let alog = st.alog.expect("root is not prepared");
        let allocator = st.allocator.as_mut().unwrap();
        for entry in alog.uncommitted(arena).iter().rev() {
            match entry.flags {
                FLAG_ALLOC => allocator.apply_release(entry.interval()),
                FLAG_RELEASE => allocator.note_alloc(entry.interval()),
                _ => unreachable!("init entries never sit in a transaction tail"),
            }
        }
        alog.rollback(arena);

        let olog = st.olog.unwrap();
        for entry in olog.snapshot(arena) {
            apply_recovery(arena, entry).expect("object log corrupt during rollback");
        }
        olog.reset(arena);

        let hdr = self.header();
        hdr.id_next.store(hdr.id_stable.load(SeqCst), SeqCst);
        log::trace!("transaction rolled back");
    }
}

fn apply_recovery(arena: &Arena, entry: ObjLogEntry) -> Result<()> {
    if entry.cell == 0 || entry.cell >= arena.capacity() {
        return Err(Error::InconsistentReplay("object log entry out of range"));
    }
    match entry.kind {
        KIND_CELL => cell::recover_raw(arena, entry.cell, entry.tid, entry.payload),
        KIND_SLOT => PSlot::recover_raw(arena, entry.cell, entry.tid, entry.payload),
        _ => return Err(Error::InconsistentReplay("unknown object log entry kind")),
    }
    Ok(())
}

/// An open writer transaction. All mutation flows through it: object
/// allocation, copy-on-write access, raw allocation and deferred
/// destruction. Consumed by [`commit`](Tx::commit) or
/// [`rollback`](Tx::rollback); dropping an unconsumed transaction
/// rolls back.
pub struct Tx<'a> {
    root: &'a TransactionRoot,
    state: RefCell<RwLockWriteGuard<'a, RootState>>,
    done: Cell<bool>,
}

impl Scope for Tx<'_> {
    fn arena(&self) -> &Arena {
        &self.root.arena
    }
}

impl<'a> Tx<'a> {
    /// The id labeling writes of this transaction.
    pub fn id(&self) -> u64 {
        self.root.header().id_next.load(SeqCst)
    }

    /// Allocate `bytes` of contiguous arena space, logged for replay
    /// and undone on rollback. Returns the offset.
    pub fn alloc_raw(&self, bytes: u64) -> Result<u64> {
        assert!(bytes > 0, "zero-length allocation");
        let mut guard = self.state.borrow_mut();
        let st = &mut **guard;
        let allocator = st.allocator.as_mut().unwrap();
        let iv = allocator.alloc_contiguous(bytes)?;
        let alog = st.alog.as_ref().unwrap();
        if let Err(e) = alog.append(&self.root.arena, LogEntry::alloc(iv)) {
            allocator.free(&[iv]);
            return Err(e);
        }
        Ok(iv.offset)
    }

    /// Free a region immediately, logged as a RELEASE entry. Only
    /// legal for regions allocated within this same transaction;
    /// anything older must go through
    /// [`queue_release`](Self::queue_release) so rollback can keep it
    /// alive.
    pub fn free_raw(&self, region: Interval) -> Result<()> {
        let mut guard = self.state.borrow_mut();
        let st = &mut **guard;
        let allocator = st.allocator.as_mut().unwrap();
        let rounded = Interval::new(region.offset, p2roundup(region.length, allocator.unit()));
        let alog = st.alog.as_ref().unwrap();
        alog.append(&self.root.arena, LogEntry::release(rounded))?;
        allocator.free(&[rounded]);
        Ok(())
    }

    /// Defer destruction of a region to commit; rollback forgets the
    /// task. A zero-length region runs only its retire callback.
    pub fn queue_release(&self, region: Interval, retire: Option<RetireFn>) {
        self.state
            .borrow_mut()
            .release_queue
            .push(ReleaseTask { region, retire });
    }

    /// Queue the regions `value` owns right now. For values about to
    /// be overwritten in place, where a deferred callback would read
    /// the overwriting value instead.
    pub(crate) fn retire_now<T: Persist>(&self, value: &T) {
        let mut guard = self.state.borrow_mut();
        let st = &mut **guard;
        let mut ctx = ReleaseCtx {
            arena: &self.root.arena,
            queue: &mut st.release_queue,
        };
        value.retire(&mut ctx);
    }

    pub(crate) fn log_cell(&self, cell: u64, tid: u64, payload: u64) -> Result<()> {
        let guard = self.state.borrow();
        guard.olog.unwrap().push(
            &self.root.arena,
            ObjLogEntry {
                cell,
                tid,
                payload,
                kind: KIND_CELL,
            },
        )
    }

    pub(crate) fn log_slot(&self, cell: u64, tid: u64, payload: u64) -> Result<()> {
        let guard = self.state.borrow();
        guard.olog.unwrap().push(
            &self.root.arena,
            ObjLogEntry {
                cell,
                tid,
                payload,
                kind: KIND_SLOT,
            },
        )
    }

    /// Allocate a persistent object holding `value` and return a
    /// reference to its cell.
    pub fn alloc_object<T: Persist>(&self, value: T) -> Result<PRef<T>> {
        let bytes = std::mem::size_of::<T>() as u64;
        assert!(bytes > 0, "zero-sized persistent objects are not supported");
        let payload = self.alloc_raw(bytes)?;
        unsafe { std::ptr::write(self.root.arena.at::<T>(payload), value) };
        let cell = self.alloc_raw(CELL_BYTES)?;
        unsafe {
            std::ptr::write(
                self.root.arena.at::<CellHeader>(cell),
                CellHeader {
                    tid: self.id(),
                    payload,
                },
            )
        };
        Ok(PRef::from_cell(cell))
    }

    /// Live allocations, as seen from inside the transaction.
    pub fn object_count(&self) -> u64 {
        self.state.borrow().allocator.as_ref().unwrap().alloc_count()
    }

    /// Free bytes, as seen from inside the transaction.
    pub fn available_bytes(&self) -> u64 {
        self.state
            .borrow()
            .allocator
            .as_ref()
            .unwrap()
            .debug_free_bytes()
    }

    /// Commit: drain the release queue (destructors first), advance
    /// the stable id, commit the allocation log, reset the object
    /// log, and squeeze the allocation log if it has outgrown the
    /// configured threshold. On failure the transaction is rolled
    /// back and the error returned.
    pub fn commit(self) -> Result<()> {
        let res = {
            let mut guard = self.state.borrow_mut();
            self.root.commit_locked(&mut guard)
        };
        if res.is_err() {
            let mut guard = self.state.borrow_mut();
            self.root.rollback_locked(&mut guard);
        }
        self.done.set(true);
        res
    }

    /// Roll back every effect of this transaction.
    pub fn rollback(self) {
        {
            let mut guard = self.state.borrow_mut();
            self.root.rollback_locked(&mut guard);
        }
        self.done.set(true);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.done.get() {
            let mut guard = self.state.borrow_mut();
            self.root.rollback_locked(&mut guard);
            log::trace!("transaction dropped without commit, rolled back");
        }
    }
}

/// A shared read guard; see
/// [`start_read_access`](TransactionRoot::start_read_access).
pub struct ReadAccess<'a> {
    root: &'a TransactionRoot,
    _guard: RwLockReadGuard<'a, RootState>,
}

impl Scope for ReadAccess<'_> {
    fn arena(&self) -> &Arena {
        &self.root.arena
    }
}
