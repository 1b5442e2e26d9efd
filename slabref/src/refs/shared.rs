use std::{fmt::Debug, ops::Deref, rc::Rc};

use crate::{
    factory::{FactoryCore, ObjPtr, ObjectFactory},
    refs::WeakRef,
};

/// Owning reference with an intrusive count
///
/// The count lives in the object header. Cloning increments it and dropping
/// decrements it; when the last shared reference goes away the object is
/// queued for destroy at the end of the frame. While any shared reference
/// exists the factory refuses to destroy the object.
pub struct SharedRef<T> {
    ptr: ObjPtr<T>,
    core: Rc<FactoryCore>,
}

impl<T> SharedRef<T> {
    /// # Safety
    ///
    /// `ptr` must be a live object of the factory owning `core`.
    pub(crate) unsafe fn from_live(core: Rc<FactoryCore>, ptr: ObjPtr<T>) -> Self {
        let hdr = ptr.header().as_ref();
        hdr.strong.set(hdr.strong.get() + 1);
        Self { ptr, core }
    }

    /// Construct an object and take the first shared reference to it
    pub fn new_in(factory: &ObjectFactory, value: T) -> Option<Self>
    where
        T: 'static,
    {
        let p = factory.new_obj(value)?;
        Some(unsafe { Self::from_live(factory.core().clone(), p) })
    }

    #[inline]
    pub fn get(&self) -> &T {
        // safety: the factory doesn't destroy objects with strong handles
        unsafe { self.ptr.as_ref() }
    }

    /// Number of shared references to this object
    pub fn strong_count(this: &Self) -> u32 {
        unsafe { this.ptr.header().as_ref().strong.get() }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    #[inline]
    pub fn obj_ptr(this: &Self) -> ObjPtr<T> {
        this.ptr
    }

    pub fn downgrade(this: &Self) -> WeakRef<T> {
        let freed = this.core.freed_flag(this.ptr.header());
        WeakRef::new(Rc::as_ptr(&this.core), this.ptr, freed)
    }
}

impl<T> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        unsafe { Self::from_live(self.core.clone(), self.ptr) }
    }
}

impl<T> Drop for SharedRef<T> {
    fn drop(&mut self) {
        let hdr = self.ptr.header();
        unsafe {
            let strong = hdr.as_ref().strong.get() - 1;
            hdr.as_ref().strong.set(strong);
            if strong == 0 {
                self.core.release_last_handle(hdr);
            }
        }
    }
}

impl<T> Deref for SharedRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> PartialEq for SharedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}
impl<T> Eq for SharedRef<T> {}

impl<T: Debug> Debug for SharedRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRef")
            .field("ptr", &self.ptr)
            .field("strong", &Self::strong_count(self))
            .field("value", self.get())
            .finish()
    }
}
