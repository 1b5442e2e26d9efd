use std::{
    cell::Cell,
    fmt::Debug,
    mem::ManuallyDrop,
    ops::Deref,
    ptr,
    rc::Rc,
};

use crate::{
    factory::{FactoryCore, ObjPtr, ObjectFactory},
    report::BugTag,
};

/// Lifecycle of a monitored object
///
/// `Live -> MarkedForDestroy` on [MonitorPtr::destroy];
/// `MarkedForDestroy -> Destroyed` when the last pointer goes away, at which
/// point the object is queued for destroy.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MonitorState {
    Live,
    MarkedForDestroy,
    Destroyed,
}

/// Monitor bookkeeping stored next to the value
///
/// The pointer count itself is the strong count in the object header.
#[derive(Debug)]
pub struct MonitorInfo {
    state: Cell<MonitorState>,
    /// Raw handles currently parked outside of Rust ownership
    parked: Cell<u32>,
}

pub(crate) struct Monitored<T> {
    info: MonitorInfo,
    value: T,
}

/// Counted pointer with an explicit two-phase destroy
///
/// Meant for handing objects across a boundary (e.g. to a script runtime)
/// that holds on to raw handles. The object is only freed once [destroy] has
/// been called *and* the last pointer is gone. Access after `destroy` is
/// reported but still allowed, since the memory is kept alive by the pointer.
///
/// [destroy]: MonitorPtr::destroy
pub struct MonitorPtr<T: 'static> {
    ptr: ObjPtr<Monitored<T>>,
    core: Rc<FactoryCore>,
}

/// A monitor pointer parked outside of Rust ownership
///
/// Holds one pointer count and marks the object as externally retained until
/// turned back into a [MonitorPtr].
pub struct RawMonitor<T: 'static> {
    ptr: ObjPtr<Monitored<T>>,
}

impl<T: 'static> RawMonitor<T> {
    /// Address identifying the object across the boundary
    pub fn addr(&self) -> usize {
        self.ptr.addr()
    }
}

impl<T: 'static> Debug for RawMonitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMonitor").field("ptr", &self.ptr).finish()
    }
}

impl<T: 'static> MonitorPtr<T> {
    /// # Safety
    ///
    /// `ptr` must be a live object of the factory owning `core`.
    unsafe fn attach(core: Rc<FactoryCore>, ptr: ObjPtr<Monitored<T>>) -> Self {
        let hdr = ptr.header().as_ref();
        hdr.strong.set(hdr.strong.get() + 1);
        Self { ptr, core }
    }

    /// Construct a monitored object and the first pointer to it
    pub fn create(factory: &ObjectFactory, value: T) -> Option<Self> {
        let p = factory.new_obj(Monitored {
            info: MonitorInfo {
                state: Cell::new(MonitorState::Live),
                parked: Cell::new(0),
            },
            value,
        })?;
        Some(unsafe { Self::attach(factory.core().clone(), p) })
    }

    #[inline]
    fn monitored(&self) -> &Monitored<T> {
        // safety: kept alive by our count
        unsafe { self.ptr.as_ref() }
    }

    #[inline]
    fn info(&self) -> &MonitorInfo {
        &self.monitored().info
    }

    /// Announce that the object should go away once unreferenced
    ///
    /// Returns false if it was already marked.
    pub fn destroy(this: &Self) -> bool {
        let info = this.info();
        if info.state.get() != MonitorState::Live {
            return false;
        }
        info.state.set(MonitorState::MarkedForDestroy);
        this.core.mark_monitor(this.ptr.addr());
        true
    }

    pub fn state(this: &Self) -> MonitorState {
        this.info().state.get()
    }

    /// Number of pointers (including parked raw ones) to this object
    pub fn ref_count(this: &Self) -> u32 {
        unsafe { this.ptr.header().as_ref().strong.get() }
    }

    /// Whether any raw handle to this object is parked
    pub fn is_retained(this: &Self) -> bool {
        this.info().parked.get() > 0
    }

    pub fn parked_count(this: &Self) -> u32 {
        this.info().parked.get()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    fn check_valid(&self) {
        if self.info().state.get() != MonitorState::Live {
            self.core.report_checked(
                BugTag::MonitorPtr,
                &format!("monitor_ptr access destroyed object {:?}", self.ptr),
            );
        }
    }

    /// Access the value; reported (but allowed) after [MonitorPtr::destroy]
    pub fn get(&self) -> &T {
        self.check_valid();
        &self.monitored().value
    }

    /// Park this pointer outside of Rust ownership
    pub fn into_raw(this: Self) -> RawMonitor<T> {
        let parked = this.info().parked.get();
        this.info().parked.set(parked + 1);
        if parked == 0 {
            this.core.extern_retain(this.ptr.addr());
        }

        let this = ManuallyDrop::new(this);
        // safety: `this` is never used or dropped again
        drop(unsafe { ptr::read(&this.core) });
        RawMonitor { ptr: this.ptr }
    }

    /// Take back a parked pointer
    ///
    /// # Safety
    ///
    /// `raw` must have come from [MonitorPtr::into_raw] on an object of `factory`.
    pub unsafe fn from_raw(factory: &ObjectFactory, raw: RawMonitor<T>) -> Self {
        let this = Self {
            ptr: raw.ptr,
            core: factory.core().clone(),
        };
        let parked = this.info().parked.get() - 1;
        this.info().parked.set(parked);
        if parked == 0 {
            this.core.extern_release(this.ptr.addr());
        }
        this
    }
}

impl<T: 'static> Clone for MonitorPtr<T> {
    fn clone(&self) -> Self {
        self.check_valid();
        unsafe { Self::attach(self.core.clone(), self.ptr) }
    }
}

impl<T: 'static> Drop for MonitorPtr<T> {
    fn drop(&mut self) {
        let hdr = self.ptr.header();
        unsafe {
            let strong = hdr.as_ref().strong.get() - 1;
            hdr.as_ref().strong.set(strong);
            if strong > 0 {
                return;
            }

            let info = self.info();
            if info.state.get() == MonitorState::MarkedForDestroy {
                info.state.set(MonitorState::Destroyed);
                self.core.unmark_monitor(self.ptr.addr());
                self.core.release_last_handle(hdr);
            } else if self.core.torn_down() {
                self.core.release_last_handle(hdr);
            } else {
                self.core.report_checked(
                    BugTag::MonitorPtr,
                    &format!("monitor_ptr leak: {:?} dropped without destroy", self.ptr),
                );
            }
        }
    }
}

impl<T: 'static> Deref for MonitorPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: 'static> PartialEq for MonitorPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}
impl<T: 'static> Eq for MonitorPtr<T> {}

impl<T: 'static> Debug for MonitorPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorPtr")
            .field("ptr", &self.ptr)
            .field("state", &Self::state(self))
            .field("ref_count", &Self::ref_count(self))
            .finish()
    }
}
