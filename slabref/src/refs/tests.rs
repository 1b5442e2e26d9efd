use std::{cell::Cell, rc::Rc};

use crate::{
    config::{FactoryConfig, SizeClassConfig},
    factory::ObjectFactory,
    report::{BugTag, RecordingReporter},
};

use super::*;

fn checked_factory() -> (ObjectFactory, Rc<RecordingReporter>) {
    let rec = Rc::new(RecordingReporter::new());
    let factory = ObjectFactory::with_reporter(FactoryConfig::default().checked(), rec.clone()).unwrap();
    (factory, rec)
}

/// Two 40 byte cells per block
fn tiny_block_factory() -> (ObjectFactory, Rc<RecordingReporter>) {
    let rec = Rc::new(RecordingReporter::new());
    let config = FactoryConfig {
        small: SizeClassConfig {
            cell_unit: 8,
            block_max_size: 80,
            pool_count: 16,
        },
        ..FactoryConfig::default().checked()
    };
    let factory = ObjectFactory::with_reporter(config, rec.clone()).unwrap();
    (factory, rec)
}

struct Tracked {
    id: u32,
    drops: Rc<Cell<u32>>,
}

impl Tracked {
    fn new(id: u32, drops: &Rc<Cell<u32>>) -> Self {
        Self {
            id,
            drops: drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn shared_ref_last_owner_destroys() {
    let (mut factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let a = SharedRef::new_in(&factory, Tracked::new(1, &drops)).unwrap();
    let b = a.clone();
    assert_eq!(SharedRef::strong_count(&a), 2);
    assert!(SharedRef::ptr_eq(&a, &b));

    drop(a);
    assert_eq!(SharedRef::strong_count(&b), 1);
    factory.on_frame_end();
    assert_eq!(drops.get(), 0);
    assert_eq!(b.id, 1);

    // a move doesn't touch the count
    let c = b;
    assert_eq!(SharedRef::strong_count(&c), 1);

    drop(c);
    assert_eq!(factory.pending_count(), 1);
    assert_eq!(drops.get(), 0);
    factory.on_frame_end();
    assert_eq!(drops.get(), 1);
    assert_eq!(factory.live_object_count(), 0);
    assert!(rec.is_empty());
}

#[test]
fn shared_ref_blocks_destroy() {
    let (mut factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let s = SharedRef::new_in(&factory, Tracked::new(5, &drops)).unwrap();
    let p = SharedRef::obj_ptr(&s);
    unsafe { factory.delete_obj_immediately(p) };
    assert_eq!(rec.tags(), vec![BugTag::SharedRef]);
    assert_eq!(drops.get(), 0);
    assert_eq!(s.id, 5);

    // queued while shared: refused at frame end, then destroyed after the last drop
    unsafe { factory.delete_obj(p) };
    factory.on_frame_end();
    assert_eq!(rec.count(BugTag::SharedRef), 2);
    assert_eq!(drops.get(), 0);

    drop(s);
    factory.on_frame_end();
    assert_eq!(drops.get(), 1);
}

#[test]
fn shared_ref_outlives_factory() {
    let (factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));
    let s = SharedRef::new_in(&factory, Tracked::new(9, &drops)).unwrap();
    factory.new_obj(Tracked::new(10, &drops)).unwrap();

    drop(factory);
    // plain objects go with the factory
    assert_eq!(drops.get(), 1);
    assert_eq!(s.id, 9);
    drop(s);
    assert_eq!(drops.get(), 2);
    assert!(rec.is_empty());
}

#[test]
fn weak_ref_invalid_after_destroy() {
    let (mut factory, rec) = checked_factory();
    let p = factory.new_obj(42u64).unwrap();
    let w = unsafe { factory.get_weak_ref(p) };
    assert!(w.is_valid());
    assert_eq!(w.get(&factory), Some(&42));

    unsafe { factory.delete_obj(p) };
    // only queued so far
    assert!(w.is_valid());
    factory.on_frame_end();

    assert!(!w.is_valid());
    assert_eq!(w.get(&factory), None);
    assert_eq!(rec.tags(), vec![BugTag::WeakRef]);
    assert_eq!(w.as_ptr(), p.as_ptr() as *const u64);
}

#[test]
fn weak_ref_cell_reuse() {
    let (mut factory, rec) = checked_factory();
    let p = factory.new_obj(1u64).unwrap();
    let w = unsafe { factory.get_weak_ref(p) };
    unsafe { factory.delete_obj_immediately(p) };

    let q = factory.new_obj(2u64).unwrap();
    assert_eq!(q.addr(), p.addr());
    assert!(q.generation() > p.generation());

    assert!(!w.is_valid());
    let wq = unsafe { factory.get_weak_ref(q) };
    assert_eq!(wq.get(&factory), Some(&2));
    assert_ne!(w, wq);
    assert!(rec.is_empty());
}

#[test]
fn weak_ref_block_freed() {
    let (mut factory, rec) = tiny_block_factory();
    let a = factory.new_obj(1u64).unwrap();
    let b = factory.new_obj(2u64).unwrap();
    assert_eq!(factory.heap().block_count(), 1);

    let w = unsafe { factory.get_weak_ref(a) };
    unsafe {
        factory.delete_obj(a);
        factory.delete_obj(b);
    }
    factory.on_frame_end();
    assert_eq!(factory.cleanup_mem_step(), 1);
    assert_eq!(factory.heap().block_count(), 0);

    assert!(format!("{:?}", w).contains("block_freed: Some(true)"));
    assert!(!w.is_valid());
    assert_eq!(w.get(&factory), None);
    assert_eq!(rec.tags(), vec![BugTag::WeakRef]);
}

#[test]
fn weak_ref_wrong_factory() {
    let (factory_a, rec_a) = checked_factory();
    let (factory_b, rec_b) = checked_factory();
    let p = factory_a.new_obj(3u32).unwrap();
    let w = unsafe { factory_a.get_weak_ref(p) };
    assert_eq!(w.get(&factory_b), None);
    assert_eq!(rec_b.tags(), vec![BugTag::WeakRef]);
    assert_eq!(w.get(&factory_a), Some(&3));
    assert!(rec_a.is_empty());
}

#[test]
fn null_refs() {
    let (factory, rec) = checked_factory();
    let w = WeakRef::<u32>::null();
    assert!(w.is_null());
    assert!(!w.is_valid());
    assert!(w.as_ptr().is_null());
    assert_eq!(w.get(&factory), None);

    let t = factory.null_temp_ref::<u32>();
    assert!(t.is_null());
    assert_eq!(t.get(), None);
    assert!(t.to_weak().is_null());

    assert_eq!(rec.tags(), vec![BugTag::WeakRef, BugTag::TempRef]);
}

#[test]
fn temp_ref_flags_destroyed_this_frame() {
    let (mut factory, rec) = checked_factory();
    let p = factory.new_obj(7u32).unwrap();
    let keep = factory.new_obj(8u32).unwrap();

    let t = unsafe { factory.get_temp_ref(p) };
    assert_eq!(t.get(), Some(&7));

    unsafe { factory.delete_obj_immediately(p) };
    let t = unsafe { factory.get_temp_ref(p) };
    assert!(!t.is_valid());
    assert_eq!(t.get(), None);
    assert_eq!(rec.tags(), vec![BugTag::TempRef]);

    factory.on_frame_end();
    let t = unsafe { factory.get_temp_ref(keep) };
    assert_eq!(t.get(), Some(&8));
    assert_eq!(rec.count(BugTag::TempRef), 1);
}

#[test]
fn temp_ref_reused_address_same_frame() {
    let (mut factory, rec) = checked_factory();
    let p = factory.new_obj(1u32).unwrap();
    unsafe { factory.delete_obj_immediately(p) };
    let q = factory.new_obj(2u32).unwrap();
    assert_eq!(p.addr(), q.addr());

    let stale = unsafe { factory.get_temp_ref(p) };
    let fresh = unsafe { factory.get_temp_ref(q) };
    assert_eq!(fresh.get(), Some(&2));
    assert_eq!(stale.get(), None);
    assert_eq!(rec.tags(), vec![BugTag::TempRef]);
}

#[test]
fn temp_ref_arena_reset() {
    let (mut factory, _) = checked_factory();
    let p = factory.new_obj(1u32).unwrap();
    for _ in 0..100 {
        let t = unsafe { factory.get_temp_ref(p) };
        assert!(t.is_valid());
    }
    let used = factory.frame_arena_bytes();
    assert!(used > 0);
    factory.on_frame_end();
    // reset keeps (at most) one chunk around, but nothing new is handed out
    let t = unsafe { factory.get_temp_ref(p) };
    assert!(t.is_valid());
    assert!(factory.frame_arena_bytes() <= used);
}

#[test]
fn ref_conversions() {
    let (mut factory, rec) = checked_factory();
    let p = factory.new_obj(11u32).unwrap();

    let w = unsafe { factory.get_weak_ref(p) };
    let t = w.to_temp(&factory);
    assert_eq!(t.get(), Some(&11));
    let w2 = t.to_weak();
    assert_eq!(w, w2);
    assert!(w2.is_valid());
    assert_eq!(t.obj_ptr(), Some(p));

    unsafe { factory.delete_obj_immediately(p) };
    let t = w.to_temp(&factory);
    assert!(t.is_null());
    assert!(!w2.is_valid());
    assert!(rec.is_empty());

    let s = SharedRef::new_in(&factory, 12u32).unwrap();
    let ws = SharedRef::downgrade(&s);
    assert_eq!(ws.get(&factory), Some(&12));
    drop(s);
    factory.on_frame_end();
    assert!(!ws.is_valid());
}

#[test]
fn unchecked_mode_stays_quiet() {
    let rec = Rc::new(RecordingReporter::new());
    let config = FactoryConfig {
        checked: false,
        ..FactoryConfig::default()
    };
    let mut factory = ObjectFactory::with_reporter(config, rec.clone()).unwrap();
    assert!(!factory.is_checked());

    let p = factory.new_obj(5u32).unwrap();
    let w = unsafe { factory.get_weak_ref(p) };
    unsafe { factory.delete_obj_immediately(p) };

    assert_eq!(w.get(&factory), None);
    let t = unsafe { factory.get_temp_ref(p) };
    assert_eq!(t.get(), None);
    assert!(rec.is_empty());
}

#[test]
fn monitor_two_phase_destroy() {
    let (mut factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let m = MonitorPtr::create(&factory, Tracked::new(3, &drops)).unwrap();
    let m2 = m.clone();
    assert_eq!(MonitorPtr::ref_count(&m), 2);
    assert_eq!(MonitorPtr::state(&m), MonitorState::Live);
    assert_eq!(m.id, 3);
    assert!(rec.is_empty());

    assert!(MonitorPtr::destroy(&m));
    assert!(!MonitorPtr::destroy(&m));
    assert_eq!(MonitorPtr::state(&m2), MonitorState::MarkedForDestroy);

    // still readable, but reported
    assert_eq!(m2.get().id, 3);
    assert_eq!(rec.tags(), vec![BugTag::MonitorPtr]);

    drop(m);
    factory.on_frame_end();
    assert_eq!(drops.get(), 0);
    assert_eq!(factory.leak_check(), 1);
    assert_eq!(rec.count(BugTag::MonitorPtr), 2);

    drop(m2);
    assert_eq!(factory.pending_count(), 1);
    factory.on_frame_end();
    assert_eq!(drops.get(), 1);
    assert_eq!(factory.live_object_count(), 0);
    assert_eq!(factory.leak_check(), 0);
}

#[test]
fn monitor_leak_reported() {
    let (factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let m = MonitorPtr::create(&factory, Tracked::new(4, &drops)).unwrap();
    drop(m);
    assert_eq!(rec.tags(), vec![BugTag::MonitorPtr]);
    assert_eq!(factory.live_object_count(), 1);
    assert_eq!(factory.pending_count(), 0);

    // reclaimed with the factory
    drop(factory);
    assert_eq!(drops.get(), 1);
}

#[test]
fn monitor_raw_round_trip() {
    let (mut factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let m = MonitorPtr::create(&factory, Tracked::new(6, &drops)).unwrap();
    let raw = MonitorPtr::into_raw(m.clone());
    assert!(MonitorPtr::is_retained(&m));
    assert_eq!(MonitorPtr::ref_count(&m), 2);
    println!("{:?}", raw);

    MonitorPtr::destroy(&m);
    drop(m);
    factory.on_frame_end();
    // the parked pointer keeps it alive
    assert_eq!(drops.get(), 0);

    let back = unsafe { MonitorPtr::from_raw(&factory, raw) };
    assert!(!MonitorPtr::is_retained(&back));
    assert_eq!(MonitorPtr::ref_count(&back), 1);
    drop(back);
    factory.on_frame_end();
    assert_eq!(drops.get(), 1);
    assert!(!rec.tags().contains(&BugTag::ExternRetain));
}

#[test]
fn monitor_double_park() {
    let (mut factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let m = MonitorPtr::create(&factory, Tracked::new(7, &drops)).unwrap();
    let raw1 = MonitorPtr::into_raw(m.clone());
    let raw2 = MonitorPtr::into_raw(m.clone());
    let addr = raw2.addr();
    assert_eq!(MonitorPtr::parked_count(&m), 2);
    assert_eq!(MonitorPtr::ref_count(&m), 3);

    // one handle back, the other is still out
    let back1 = unsafe { MonitorPtr::from_raw(&factory, raw1) };
    assert!(MonitorPtr::is_retained(&m));
    assert_eq!(MonitorPtr::parked_count(&m), 1);
    assert_eq!(MonitorPtr::ref_count(&m), 3);
    assert!(factory.core().is_extern_retained(addr));

    let back2 = unsafe { MonitorPtr::from_raw(&factory, raw2) };
    assert!(!MonitorPtr::is_retained(&m));
    assert!(!factory.core().is_extern_retained(addr));

    MonitorPtr::destroy(&m);
    drop(back1);
    drop(back2);
    drop(m);
    factory.on_frame_end();
    assert_eq!(drops.get(), 1);
    assert!(rec.is_empty());
}

#[test]
fn monitor_outlives_factory() {
    let (factory, rec) = checked_factory();
    let drops = Rc::new(Cell::new(0));

    let m = MonitorPtr::create(&factory, Tracked::new(8, &drops)).unwrap();
    MonitorPtr::destroy(&m);
    drop(factory);
    // marked but still referenced at teardown
    assert_eq!(rec.tags(), vec![BugTag::MonitorPtr]);
    assert_eq!(drops.get(), 0);
    drop(m);
    assert_eq!(drops.get(), 1);
}
