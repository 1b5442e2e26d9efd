//! Object factory: the single authority for creating and destroying objects
//!
//! Objects live in cells of two [SlabHeap]s (a small-object heap and a
//! one-cell-per-block large-object heap). Every object is prefixed by an
//! [ObjectHeader] carrying its generation id, its strong handle count and its
//! destroy state.
//!
//! Objects are only ever destroyed through `&mut ObjectFactory` (or after the
//! factory is gone), so any `&T` handed out by a reference type while the
//! factory is borrowed stays valid for that borrow.

use std::{
    alloc::Layout,
    cell::{Cell, Ref, RefCell},
    fmt::Debug,
    hash::Hash,
    mem,
    ptr::{self, NonNull},
    rc::Rc,
};

use bumpalo::Bump;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::Level;

use crate::{
    config::{ConfigError, FactoryConfig},
    refs::{SharedRef, TempRef, WeakRef},
    report::{BugReporter, BugTag, TracingReporter},
    size_class::SlabHeap,
    util::UsizePtr,
};

/// Which heap an object was allocated from
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapKind {
    Small = 0,
    Large = 1,
}

/// Destroy state of a live object
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjState {
    Live = 0,
    /// On the pending list, destroyed at frame end
    Queued = 1,
}

/// Bookkeeping in front of every object
#[repr(C)]
pub struct ObjectHeader {
    /// Must stay the first field; weak references read it through a bare pointer
    pub(crate) generation: Cell<u64>,
    /// Shared references and monitor pointers currently alive
    pub(crate) strong: Cell<u32>,
    pub(crate) state: Cell<ObjState>,
    pub(crate) heap: HeapKind,
    drop_value: unsafe fn(NonNull<ObjectHeader>),
}

impl Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("@addr", &(self as *const _))
            .field("generation", &self.generation.get())
            .field("strong", &self.strong.get())
            .field("state", &self.state.get())
            .field("heap", &self.heap)
            .finish()
    }
}

/// Storage of one object inside a cell
#[repr(C)]
pub struct Object<T> {
    pub(crate) header: ObjectHeader,
    pub(crate) value: T,
}

unsafe fn drop_value<T>(obj: NonNull<ObjectHeader>) {
    ptr::drop_in_place(ptr::addr_of_mut!((*obj.cast::<Object<T>>().as_ptr()).value));
}

/// Raw, unchecked pointer to a factory object
///
/// This is what [ObjectFactory::new_obj] hands out. It remembers the
/// generation of the object it was created for, but nothing stops it from
/// outliving that object; all the checked handles are minted from it.
pub struct ObjPtr<T> {
    ptr: NonNull<Object<T>>,
    generation: u64,
}

impl<T> Clone for ObjPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ObjPtr<T> {}
impl<T> PartialEq for ObjPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.generation == other.generation
    }
}
impl<T> Eq for ObjPtr<T> {}
impl<T> Hash for ObjPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
        self.generation.hash(state);
    }
}
impl<T> Debug for ObjPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjPtr")
            .field("ptr", &UsizePtr::from(self.ptr))
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> ObjPtr<T> {
    #[inline]
    pub(crate) fn from_parts(ptr: NonNull<Object<T>>, generation: u64) -> Self {
        Self { ptr, generation }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Address of the object (its header), used as its identity
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn object(&self) -> NonNull<Object<T>> {
        self.ptr
    }

    #[inline]
    pub(crate) fn header(&self) -> NonNull<ObjectHeader> {
        self.ptr.cast()
    }

    /// Pointer to the value; not dereferenceable once the object is gone
    pub fn as_ptr(&self) -> *mut T {
        unsafe { ptr::addr_of_mut!((*self.ptr.as_ptr()).value) }
    }

    /// # Safety
    ///
    /// The object must be alive for `'a`.
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        &*self.as_ptr()
    }

    /// # Safety
    ///
    /// The object must be alive for `'a` and not otherwise borrowed.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut T {
        &mut *self.as_ptr()
    }

    /// Whether this pointer still names a live object
    ///
    /// # Safety
    ///
    /// The cell must still be allocated (see [ObjectFactory::get_weak_ref]).
    pub unsafe fn is_current(&self) -> bool {
        (*self.header().as_ptr()).generation.get() == self.generation
    }
}

/// State shared between the factory and the handles that need to reach it
/// from their destructors
pub(crate) struct FactoryCore {
    small: RefCell<SlabHeap>,
    large: RefCell<SlabHeap>,
    next_generation: Cell<u64>,
    pending: RefCell<Vec<NonNull<ObjectHeader>>>,
    /// Address -> generation of objects destroyed during the current frame
    destroyed_this_frame: RefCell<FxHashMap<usize, u64>>,
    retained: RefCell<FxHashSet<usize>>,
    /// Monitors marked for destroy that still have pointers
    marked_monitors: RefCell<FxHashSet<usize>>,
    reporter: RefCell<Rc<dyn BugReporter>>,
    checked: bool,
    frame: Cell<u64>,
    live_objects: Cell<usize>,
    torn_down: Cell<bool>,
}

impl FactoryCore {
    #[inline]
    pub(crate) fn checked(&self) -> bool {
        self.checked
    }

    #[inline]
    pub(crate) fn torn_down(&self) -> bool {
        self.torn_down.get()
    }

    pub(crate) fn report(&self, tag: BugTag, message: &str) {
        let reporter = self.reporter.borrow().clone();
        reporter.report(tag, message);
    }

    /// Report a lifetime violation; these are only diagnosed in checked mode
    pub(crate) fn report_checked(&self, tag: BugTag, message: &str) {
        if self.checked {
            self.report(tag, message);
        }
    }

    pub(crate) fn destroyed_this_frame(&self, addr: usize, generation: u64) -> bool {
        self.destroyed_this_frame.borrow().get(&addr) == Some(&generation)
    }

    pub(crate) fn freed_flag(&self, obj: NonNull<ObjectHeader>) -> Option<Rc<Cell<bool>>> {
        unsafe {
            match (*obj.as_ptr()).heap {
                HeapKind::Small => self.small.borrow().freed_flag(obj.cast()),
                HeapKind::Large => self.large.borrow().freed_flag(obj.cast()),
            }
        }
    }

    pub(crate) fn mark_monitor(&self, addr: usize) {
        self.marked_monitors.borrow_mut().insert(addr);
    }

    pub(crate) fn unmark_monitor(&self, addr: usize) {
        self.marked_monitors.borrow_mut().remove(&addr);
    }

    pub(crate) fn extern_retain(&self, addr: usize) {
        if self.checked {
            self.retained.borrow_mut().insert(addr);
        }
    }

    pub(crate) fn is_extern_retained(&self, addr: usize) -> bool {
        self.retained.borrow().contains(&addr)
    }

    pub(crate) fn extern_release(&self, addr: usize) {
        if self.checked {
            self.retained.borrow_mut().remove(&addr);
        }
    }

    /// Put a live object on the pending list
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of this factory.
    pub(crate) unsafe fn queue(&self, obj: NonNull<ObjectHeader>) {
        let hdr = obj.as_ref();
        if hdr.state.get() == ObjState::Queued {
            self.report(
                BugTag::Factory,
                &format!("object {:?} is already queued for destroy", UsizePtr::from(obj)),
            );
            return;
        }
        hdr.state.set(ObjState::Queued);
        self.pending.borrow_mut().push(obj);
    }

    /// Called when the last strong handle goes away
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of this factory with no strong handles.
    pub(crate) unsafe fn release_last_handle(&self, obj: NonNull<ObjectHeader>) {
        if self.torn_down.get() {
            self.destroy_now(obj);
        } else if obj.as_ref().state.get() != ObjState::Queued {
            self.queue(obj);
        }
    }

    /// Run the destructor and give the cell back
    ///
    /// Refused (with a report) while strong handles exist.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of this factory, not on the pending list.
    pub(crate) unsafe fn destroy_now(&self, obj: NonNull<ObjectHeader>) {
        let hdr = obj.as_ref();
        let addr = obj.as_ptr() as usize;

        let strong = hdr.strong.get();
        if strong > 0 {
            self.report(
                BugTag::SharedRef,
                &format!(
                    "destroying object {:?} which still has {} strong handles",
                    UsizePtr::from(obj),
                    strong
                ),
            );
            hdr.state.set(ObjState::Live);
            return;
        }

        if self.checked {
            if self.retained.borrow_mut().remove(&addr) {
                self.report(
                    BugTag::ExternRetain,
                    &format!(
                        "destroying object {:?} which is still externally retained",
                        UsizePtr::from(obj)
                    ),
                );
            }
            self.destroyed_this_frame
                .borrow_mut()
                .insert(addr, hdr.generation.get());
        }

        tracing::event!(
            name: "factory::destroy",
            Level::TRACE,
            ptr = ?UsizePtr::from(obj),
            generation = hdr.generation.get()
        );

        let heap = hdr.heap;
        let drop_fn = hdr.drop_value;
        hdr.generation.set(0);
        drop_fn(obj);

        let freed = match heap {
            HeapKind::Small => self.small.borrow_mut().free(obj.cast()),
            HeapKind::Large => self.large.borrow_mut().free(obj.cast()),
        };
        if freed {
            self.live_objects.set(self.live_objects.get() - 1);
        }
    }

    /// Destroy everything on the pending list, including objects queued while
    /// doing so; returns how many were processed
    fn drain_pending(&self) -> usize {
        let mut n = 0;
        loop {
            let batch = mem::take(&mut *self.pending.borrow_mut());
            if batch.is_empty() {
                return n;
            }
            for obj in batch {
                unsafe { self.destroy_now(obj) };
                n += 1;
            }
        }
    }

    fn leak_check(&self) -> usize {
        let marked: Vec<usize> = self.marked_monitors.borrow().iter().copied().collect();
        for addr in &marked {
            let strong = unsafe { (*(*addr as *const ObjectHeader)).strong.get() };
            self.report(
                BugTag::MonitorPtr,
                &format!(
                    "monitor_ptr leak: {:?} is marked for destroy but has {} pointers",
                    UsizePtr::from(*addr as *const ObjectHeader),
                    strong
                ),
            );
        }
        marked.len()
    }
}

/// Owner of all objects and their memory
pub struct ObjectFactory {
    core: Rc<FactoryCore>,
    frame_arena: Bump,
}

impl Debug for ObjectFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFactory")
            .field("@addr", &(self as *const _))
            .field("checked", &self.core.checked)
            .field("frame", &self.core.frame.get())
            .field("live_objects", &self.core.live_objects.get())
            .field("pending", &self.core.pending.borrow().len())
            .field("frame_arena_bytes", &self.frame_arena.allocated_bytes())
            .finish()
    }
}

impl Default for ObjectFactory {
    fn default() -> Self {
        match Self::new(FactoryConfig::default()) {
            Ok(x) => x,
            Err(_) => unreachable!("default config is valid"),
        }
    }
}

impl ObjectFactory {
    /// Create a factory reporting to `tracing`
    pub fn new(config: FactoryConfig) -> Result<Self, ConfigError> {
        Self::with_reporter(config, Rc::new(TracingReporter))
    }

    pub fn with_reporter(config: FactoryConfig, reporter: Rc<dyn BugReporter>) -> Result<Self, ConfigError> {
        config.validate()?;
        let small = SlabHeap::new(config.small, reporter.clone())?;
        let large = SlabHeap::new(config.large, reporter.clone())?;

        tracing::event!(Level::DEBUG, checked = config.checked, "object factory created");

        Ok(Self {
            core: Rc::new(FactoryCore {
                small: RefCell::new(small),
                large: RefCell::new(large),
                next_generation: Cell::new(1),
                pending: RefCell::new(Vec::new()),
                destroyed_this_frame: RefCell::new(FxHashMap::default()),
                retained: RefCell::new(FxHashSet::default()),
                marked_monitors: RefCell::new(FxHashSet::default()),
                reporter: RefCell::new(reporter),
                checked: config.checked,
                frame: Cell::new(0),
                live_objects: Cell::new(0),
                torn_down: Cell::new(false),
            }),
            frame_arena: Bump::with_capacity(config.frame_arena_capacity),
        })
    }

    #[inline]
    pub(crate) fn core(&self) -> &Rc<FactoryCore> {
        &self.core
    }

    #[inline]
    pub fn is_checked(&self) -> bool {
        self.core.checked
    }

    /// Current diagnostic sink
    pub fn reporter(&self) -> Rc<dyn BugReporter> {
        self.core.reporter.borrow().clone()
    }

    /// Swap the diagnostic sink (of the factory and both heaps), returning the old one
    pub fn replace_reporter(&self, reporter: Rc<dyn BugReporter>) -> Rc<dyn BugReporter> {
        self.core.small.borrow_mut().set_reporter(reporter.clone());
        self.core.large.borrow_mut().set_reporter(reporter.clone());
        self.core.reporter.replace(reporter)
    }

    /// Construct an object
    ///
    /// Returns `None` (with a report) if the object doesn't fit either heap or
    /// is over-aligned.
    pub fn new_obj<T: 'static>(&self, value: T) -> Option<ObjPtr<T>> {
        let layout = Layout::new::<Object<T>>();
        let small_fits = self.core.small.borrow().config().fits(layout.size());
        let large_fits = self.core.large.borrow().config().fits(layout.size());
        let (heap, mem) = if small_fits {
            (HeapKind::Small, self.core.small.borrow_mut().alloc_layout(layout)?)
        } else if large_fits {
            (HeapKind::Large, self.core.large.borrow_mut().alloc_layout(layout)?)
        } else {
            self.core.report(
                BugTag::MemPool,
                &format!(
                    "{} ({} bytes) is too large for any heap",
                    std::any::type_name::<T>(),
                    layout.size()
                ),
            );
            return None;
        };

        let generation = self.core.next_generation.get();
        self.core.next_generation.set(generation + 1);

        let obj = mem.cast::<Object<T>>();
        unsafe {
            obj.as_ptr().write(Object {
                header: ObjectHeader {
                    generation: Cell::new(generation),
                    strong: Cell::new(0),
                    state: Cell::new(ObjState::Live),
                    heap,
                    drop_value: drop_value::<T>,
                },
                value,
            });
        }
        self.core.live_objects.set(self.core.live_objects.get() + 1);

        tracing::event!(
            name: "factory::new_obj",
            Level::TRACE,
            ty = std::any::type_name::<T>(),
            ?heap,
            ptr = ?UsizePtr::from(obj),
            generation
        );

        Some(ObjPtr::from_parts(obj, generation))
    }

    /// Queue an object for destruction at the end of the frame
    ///
    /// Deleting an object that is already queued is reported and ignored.
    ///
    /// # Safety
    ///
    /// `p` must come from this factory. Its cell must still be allocated:
    /// either the object is alive, or it was destroyed during the current frame.
    pub unsafe fn delete_obj<T>(&self, p: ObjPtr<T>) {
        if !p.is_current() {
            self.core
                .report(BugTag::Factory, &format!("delete_obj of dead object {:?}", p));
            return;
        }
        self.core.queue(p.header());
    }

    /// Destroy an object right now
    ///
    /// If it was queued, it is taken off the pending list first.
    ///
    /// # Safety
    ///
    /// Same as [ObjectFactory::delete_obj].
    pub unsafe fn delete_obj_immediately<T>(&mut self, p: ObjPtr<T>) {
        if !p.is_current() {
            self.core.report(
                BugTag::Factory,
                &format!("delete_obj_immediately of dead object {:?}", p),
            );
            return;
        }
        let hdr = p.header();
        if hdr.as_ref().state.get() == ObjState::Queued {
            self.core.pending.borrow_mut().retain(|&q| q != hdr);
        }
        self.core.destroy_now(hdr);
    }

    /// End the current frame
    ///
    /// Destroys everything queued (in queue order, including objects queued by
    /// those destructors), then resets the temporary reference arena and the
    /// destroyed-this-frame tracking.
    pub fn on_frame_end(&mut self) {
        let trace_span = tracing::span!(
            Level::TRACE,
            "factory::on_frame_end",
            frame = self.core.frame.get()
        );
        let _span_enter = trace_span.enter();

        let destroyed = self.core.drain_pending();

        self.frame_arena.reset();
        self.core.destroyed_this_frame.borrow_mut().clear();
        self.core.frame.set(self.core.frame.get() + 1);

        tracing::event!(Level::TRACE, destroyed, live = self.core.live_objects.get());
    }

    /// One incremental reclamation step: small heap first, large heap if the
    /// small one had nothing to release
    pub fn cleanup_mem_step(&mut self) -> usize {
        let n = self.core.small.borrow_mut().cleanup_step();
        if n > 0 {
            return n;
        }
        self.core.large.borrow_mut().cleanup_step()
    }

    /// Mint a weak reference
    ///
    /// # Safety
    ///
    /// Same as [ObjectFactory::delete_obj].
    pub unsafe fn get_weak_ref<T>(&self, p: ObjPtr<T>) -> WeakRef<T> {
        let freed = if p.is_current() {
            self.core.freed_flag(p.header())
        } else {
            self.core.report_checked(
                BugTag::WeakRef,
                &format!("weak ref minted from dead object {:?}", p),
            );
            None
        };
        WeakRef::new(Rc::as_ptr(&self.core), p, freed)
    }

    /// Mint a temporary reference, valid until the end of the frame
    ///
    /// # Safety
    ///
    /// Same as [ObjectFactory::delete_obj].
    pub unsafe fn get_temp_ref<T>(&self, p: ObjPtr<T>) -> &TempRef<'_, T> {
        self.frame_arena.alloc(TempRef::new(&self.core, Some(p)))
    }

    /// A temporary reference to nothing
    pub fn null_temp_ref<T>(&self) -> &TempRef<'_, T> {
        self.frame_arena.alloc(TempRef::new(&self.core, None))
    }

    /// Mint a shared (strong) reference
    ///
    /// Returns `None` (with a report) if the object is already dead.
    ///
    /// # Safety
    ///
    /// Same as [ObjectFactory::delete_obj].
    pub unsafe fn get_shared_ref<T>(&self, p: ObjPtr<T>) -> Option<SharedRef<T>> {
        if !p.is_current() {
            self.core.report(
                BugTag::SharedRef,
                &format!("shared ref minted from dead object {:?}", p),
            );
            return None;
        }
        Some(SharedRef::from_live(self.core.clone(), p))
    }

    /// Record that `p` is held outside the managed references
    pub fn extern_retain<T>(&self, p: ObjPtr<T>) {
        self.core.extern_retain(p.addr());
    }

    pub fn extern_release<T>(&self, p: ObjPtr<T>) {
        self.core.extern_release(p.addr());
    }

    pub fn is_extern_retained<T>(&self, p: ObjPtr<T>) -> bool {
        self.core.is_extern_retained(p.addr())
    }

    /// Report every monitor that is marked for destroy but still referenced;
    /// returns how many there are
    pub fn leak_check(&self) -> usize {
        self.core.leak_check()
    }

    pub fn live_object_count(&self) -> usize {
        self.core.live_objects.get()
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending.borrow().len()
    }

    /// Number of frames ended so far
    pub fn frame_index(&self) -> u64 {
        self.core.frame.get()
    }

    /// Bytes used by temporary references this frame
    pub fn frame_arena_bytes(&self) -> usize {
        self.frame_arena.allocated_bytes()
    }

    pub fn heap(&self) -> Ref<'_, SlabHeap> {
        self.core.small.borrow()
    }

    pub fn large_heap(&self) -> Ref<'_, SlabHeap> {
        self.core.large.borrow()
    }
}

impl Drop for ObjectFactory {
    fn drop(&mut self) {
        let trace_span = tracing::span!(Level::TRACE, "factory::drop");
        let _span_enter = trace_span.enter();

        self.core.drain_pending();
        self.core.leak_check();

        // Objects with strong handles outlive the factory; the last handle
        // destroys them.
        let mut remaining = Vec::new();
        let mut collect = |p: NonNull<u8>| remaining.push(p.cast::<ObjectHeader>());
        self.core.small.borrow().for_each_used(&mut collect);
        self.core.large.borrow().for_each_used(&mut collect);
        for obj in remaining {
            unsafe {
                // queued ones (released by an earlier destructor) are drained below
                let hdr = obj.as_ref();
                if hdr.strong.get() == 0 && hdr.state.get() == ObjState::Live {
                    self.core.destroy_now(obj);
                }
            }
        }
        self.core.drain_pending();
        self.core.torn_down.set(true);

        tracing::event!(Level::TRACE, outliving = self.core.live_objects.get());
    }
}
