mod common;

use agate::{
    Config, PList, PMap, PRef, PSlot, PVec, Persist, ReleaseCtx, Result, TransactionRoot, Tx,
};

const MB: u64 = 1024 * 1024;

fn test_config(capacity: u64) -> Config {
    Config {
        capacity,
        min_alloc_unit: 0x1000,
        alloc_log_entries: 256,
        squeeze_threshold: 192,
        obj_log_entries: 128,
    }
}

fn prepared_root(capacity: u64) -> TransactionRoot {
    common::setup_logger();
    let root = TransactionRoot::create(capacity);
    root.prepare(test_config(capacity)).unwrap();
    root
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rec {
    n1: i32,
    n2: i32,
    tag: [u8; 16],
}

impl Rec {
    fn new(n: i32) -> Rec {
        Rec {
            n1: n,
            n2: n,
            tag: [0; 16],
        }
    }
}

unsafe impl Persist for Rec {
    fn duplicate(&self, _: &Tx<'_>) -> Result<Rec> {
        Ok(*self)
    }

    fn retire(&self, _: &mut ReleaseCtx<'_>) {}
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Holder {
    n1: i32,
    n2: i32,
    a: PRef<Rec>,
}

unsafe impl Persist for Holder {
    fn duplicate(&self, _: &Tx<'_>) -> Result<Holder> {
        Ok(*self)
    }

    fn retire(&self, _: &mut ReleaseCtx<'_>) {}
}

#[repr(C)]
struct Bag {
    a: i32,
    b: i32,
    av: PVec<PRef<Rec>>,
    iv: PVec<u64>,
    il: PList<u64>,
    m: PMap<u64, u64>,
}

impl Bag {
    fn new() -> Bag {
        Bag {
            a: 0,
            b: 1,
            av: PVec::new(),
            iv: PVec::new(),
            il: PList::new(),
            m: PMap::new(),
        }
    }
}

unsafe impl Persist for Bag {
    fn duplicate(&self, tx: &Tx<'_>) -> Result<Bag> {
        Ok(Bag {
            a: self.a,
            b: self.b,
            av: self.av.duplicate(tx)?,
            iv: self.iv.duplicate(tx)?,
            il: self.il.duplicate(tx)?,
            m: self.m.duplicate(tx)?,
        })
    }

    fn retire(&self, ctx: &mut ReleaseCtx<'_>) {
        self.av.retire(ctx);
        self.iv.retire(ctx);
        self.il.retire(ctx);
        self.m.retire(ctx);
    }
}

#[test]
fn commit_publishes_and_access_is_idempotent() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let holder = tx
        .alloc_object(Holder {
            n1: 0,
            n2: 0,
            a: PRef::null(),
        })
        .unwrap();
    {
        let h = holder.access(&tx).unwrap();
        h.n1 += 1;
        h.n2 += 1;
        h.a = tx.alloc_object(Rec::new(50)).unwrap();
    }
    tx.commit().unwrap();

    {
        let read = root.start_read_access();
        let h = holder.inspect(&read);
        assert_eq!((h.n1, h.n2), (1, 1));
        assert_eq!(h.a.inspect(&read).n1, 50);
    }

    let tx = root.start_transaction();
    let p1: *mut Holder = holder.access(&tx).unwrap();
    let p2: *mut Holder = holder.access(&tx).unwrap();
    assert_eq!(p1, p2, "second access within one transaction is a no-op");
    tx.rollback();
}

#[test]
fn rollback_restores_counts_and_content() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let holder = tx
        .alloc_object(Holder {
            n1: 1,
            n2: 2,
            a: PRef::null(),
        })
        .unwrap();
    tx.commit().unwrap();

    let count0 = root.object_count();
    let alog0 = root.alloc_log_size();
    let avail0 = root.available_bytes();
    let stable0 = root.stable_id();

    let tx = root.start_transaction();
    {
        let h = holder.access(&tx).unwrap();
        h.n1 = 10;
        h.n2 = 20;
        h.a = tx.alloc_object(Rec::new(7)).unwrap();
    }
    assert!(tx.object_count() > count0);
    tx.rollback();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.alloc_log_size(), alog0);
    assert_eq!(root.available_bytes(), avail0);
    assert_eq!(root.stable_id(), stable0);
    assert_eq!(root.in_flight_id(), stable0);

    let read = root.start_read_access();
    let h = holder.inspect(&read);
    assert_eq!((h.n1, h.n2), (1, 2));
    assert!(h.a.is_null());
}

#[test]
fn die_releases_at_commit_and_rolls_back_cleanly() {
    let root = prepared_root(16 * MB);

    let count0 = root.object_count();
    let avail0 = root.available_bytes();

    let tx = root.start_transaction();
    let rec = tx.alloc_object(Rec::new(3)).unwrap();
    tx.commit().unwrap();
    assert_eq!(root.object_count(), count0 + 2);

    // a rolled-back die leaves the object untouched
    let tx = root.start_transaction();
    rec.die(&tx).unwrap();
    tx.rollback();
    {
        let read = root.start_read_access();
        assert_eq!(rec.inspect(&read).n1, 3);
    }

    let tx = root.start_transaction();
    rec.die(&tx).unwrap();
    tx.commit().unwrap();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.available_bytes(), avail0);
}

#[test]
fn access_then_die_in_one_transaction() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let rec = tx.alloc_object(Rec::new(9)).unwrap();
    tx.commit().unwrap();

    let count0 = root.object_count();
    let avail0 = root.available_bytes();

    // rolled back: the mid-transaction duplicate must not leak into
    // the restored header
    let tx = root.start_transaction();
    rec.access(&tx).unwrap().n1 = 99;
    rec.die(&tx).unwrap();
    tx.rollback();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.available_bytes(), avail0);
    {
        let read = root.start_read_access();
        assert_eq!(rec.inspect(&read).n1, 9);
    }

    // committed: duplicate, original payload and cell are all freed
    let tx = root.start_transaction();
    rec.access(&tx).unwrap().n1 = 99;
    rec.die(&tx).unwrap();
    tx.commit().unwrap();

    assert_eq!(root.object_count(), count0 - 2);
    assert_eq!(root.available_bytes(), avail0 + 2 * 0x1000);
}

#[test]
fn composite_objects_survive_restart() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let bag = tx.alloc_object(Bag::new()).unwrap();
    {
        let b = bag.access(&tx).unwrap();
        b.a += 1;
        b.b += 1;
        let r55 = tx.alloc_object(Rec::new(55)).unwrap();
        let r56 = tx.alloc_object(Rec::new(56)).unwrap();
        b.av.push(&tx, r55).unwrap();
        b.av.push(&tx, r56).unwrap();
        b.iv.resize(&tx, 11, 0).unwrap();
        *b.iv.get_mut(&tx, 3) = 33;
        b.il.push_back(&tx, 144).unwrap();
        b.il.push_back(&tx, 145).unwrap();
        b.m.insert(&tx, 7, 70).unwrap();
        b.m.insert(&tx, 5, 50).unwrap();
    }
    tx.commit().unwrap();

    let count_before = root.object_count();
    let avail_before = root.available_bytes();

    root.restart().unwrap();

    assert_eq!(root.object_count(), count_before);
    assert_eq!(root.available_bytes(), avail_before);

    {
        let read = root.start_read_access();
        let b = bag.inspect(&read);
        assert_eq!((b.a, b.b), (1, 2));
        assert_eq!(b.av.len(), 2);
        assert_eq!(b.av.get(&read, 0).inspect(&read).n1, 55);
        assert_eq!(b.av.get(&read, 1).inspect(&read).n1, 56);
        assert_eq!(b.iv.len(), 11);
        assert_eq!(*b.iv.get(&read, 3), 33);
        assert_eq!(b.il.iter(&read).copied().collect::<Vec<_>>(), vec![144, 145]);
        let pairs: Vec<(u64, u64)> = b.m.iter(&read).map(|(k, v)| (*k, *v)).collect();
        assert_eq!(pairs, vec![(5, 50), (7, 70)]);
    }

    // the replayed allocator keeps working: a deep mutation commits
    // and destroys the old payload tree without upsetting accounting
    let tx = root.start_transaction();
    {
        let b = bag.access(&tx).unwrap();
        b.m.insert(&tx, 8, 80).unwrap();
        b.il.push_back(&tx, 146).unwrap();
    }
    tx.commit().unwrap();

    let read = root.start_read_access();
    let b = bag.inspect(&read);
    assert_eq!(b.m.get(&read, &8), Some(&80));
    assert_eq!(b.m.get(&read, &7), Some(&70));
    assert_eq!(b.il.len(), 3);
}

#[test]
fn squeeze_keeps_log_bounded_and_replayable() {
    common::setup_logger();
    let capacity = 16 * MB;
    let root = TransactionRoot::create(capacity);
    root.prepare(Config {
        capacity,
        min_alloc_unit: 0x1000,
        alloc_log_entries: 64,
        squeeze_threshold: 8,
        obj_log_entries: 64,
    })
    .unwrap();

    let mut objects = vec![];
    for i in 0..10_u64 {
        let tx = root.start_transaction();
        objects.push(tx.alloc_object(i * 100).unwrap());
        tx.commit().unwrap();
    }

    // without squeezes the log would hold the prepare entries plus
    // two per object
    assert!(root.alloc_log_size() <= 10);

    let count_before = root.object_count();
    root.restart().unwrap();
    assert_eq!(root.object_count(), count_before);

    {
        let read = root.start_read_access();
        for (i, obj) in objects.iter().enumerate() {
            assert_eq!(*obj.inspect(&read), i as u64 * 100);
        }
    }

    // and the squeezed log still accepts new work
    let tx = root.start_transaction();
    let extra = tx.alloc_object(4242_u64).unwrap();
    tx.commit().unwrap();
    let read = root.start_read_access();
    assert_eq!(*extra.inspect(&read), 4242);
}

#[test]
fn alloc_failure_leaves_transaction_usable() {
    let root = prepared_root(4 * MB);

    let tx = root.start_transaction();
    let err = tx.alloc_raw(64 * MB).unwrap_err();
    assert_eq!(err, agate::Error::OutOfSpace);

    // the failed allocation held nothing back
    let obj = tx.alloc_object(1_u64).unwrap();
    tx.commit().unwrap();

    let read = root.start_read_access();
    assert_eq!(*obj.inspect(&read), 1);
}

#[repr(C)]
struct SlotBox {
    s: PSlot,
}

unsafe impl Persist for SlotBox {
    fn duplicate(&self, tx: &Tx<'_>) -> Result<SlotBox> {
        Ok(SlotBox {
            s: self.s.duplicate(tx)?,
        })
    }

    fn retire(&self, ctx: &mut ReleaseCtx<'_>) {
        self.s.retire(ctx);
    }
}

#[test]
fn unique_slot_replacement_and_rollback() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let boxed = tx.alloc_object(SlotBox { s: PSlot::null() }).unwrap();
    {
        let sb = boxed.access(&tx).unwrap();
        sb.s.allocate_obj(&tx, 0xabcd_u64).unwrap();
        assert_eq!(sb.s.length(), 8);
    }
    tx.commit().unwrap();

    let count0 = root.object_count();
    let avail0 = root.available_bytes();

    // replacement rolled back: the original payload survives
    let tx = root.start_transaction();
    {
        let sb = boxed.access(&tx).unwrap();
        sb.s.allocate_obj(&tx, 0x1111_u64).unwrap();
        assert_eq!(*sb.s.inspect::<u64, _>(&tx), 0x1111);
    }
    tx.rollback();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.available_bytes(), avail0);
    {
        let read = root.start_read_access();
        let sb = boxed.inspect(&read);
        assert_eq!(*sb.s.inspect::<u64, _>(&read), 0xabcd);
    }

    // replacement committed: the old payload is gone, accounting holds
    let tx = root.start_transaction();
    boxed
        .access(&tx)
        .unwrap()
        .s
        .allocate_obj(&tx, 0x2222_u64)
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.available_bytes(), avail0);
    let read = root.start_read_access();
    assert_eq!(*boxed.inspect(&read).s.inspect::<u64, _>(&read), 0x2222);
}

#[test]
fn slot_die_and_replace_in_one_transaction() {
    let root = prepared_root(16 * MB);

    let tx = root.start_transaction();
    let boxed = tx.alloc_object(SlotBox { s: PSlot::null() }).unwrap();
    boxed
        .access(&tx)
        .unwrap()
        .s
        .allocate_obj(&tx, 0xaaaa_u64)
        .unwrap();
    tx.commit().unwrap();

    let count0 = root.object_count();
    let avail0 = root.available_bytes();

    // die then replace, rolled back: the slot comes back with its
    // pre-transaction payload and length, not null and not the
    // replacement
    let tx = root.start_transaction();
    {
        let sb = boxed.access(&tx).unwrap();
        sb.s.die(&tx).unwrap();
        assert!(sb.s.is_null());
        sb.s.allocate_obj(&tx, 0xbbbb_u64).unwrap();
        assert_eq!(*sb.s.inspect::<u64, _>(&tx), 0xbbbb);
    }
    tx.rollback();

    assert_eq!(root.object_count(), count0);
    assert_eq!(root.available_bytes(), avail0);
    {
        let read = root.start_read_access();
        let sb = boxed.inspect(&read);
        assert_eq!(sb.s.length(), 8);
        assert_eq!(*sb.s.inspect::<u64, _>(&read), 0xaaaa);
    }

    // replace then die commits to a null slot
    let tx = root.start_transaction();
    {
        let sb = boxed.access(&tx).unwrap();
        sb.s.allocate_obj(&tx, 0xcccc_u64).unwrap();
        sb.s.die(&tx).unwrap();
        assert!(sb.s.is_null());
    }
    tx.commit().unwrap();

    let read = root.start_read_access();
    assert!(boxed.inspect(&read).s.is_null());
}
