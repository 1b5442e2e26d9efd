use std::{cell::Cell, fmt::Debug, ptr, rc::Rc};

use crate::{
    factory::{FactoryCore, ObjPtr, ObjectFactory},
    refs::TempRef,
    report::BugTag,
};

/// Non-owning reference checked by generation id
///
/// Valid while the object it was minted for is alive. Once the object is
/// destroyed the reference is permanently invalid, even if the cell gets
/// reused, and once the object's block is released the shared "freed" flag
/// says so without touching the released memory.
pub struct WeakRef<T> {
    ptr: Option<ObjPtr<T>>,
    /// `None` for null references and for references minted from dead objects
    freed: Option<Rc<Cell<bool>>>,
    owner: *const FactoryCore,
}

impl<T> WeakRef<T> {
    pub(crate) fn new(owner: *const FactoryCore, ptr: ObjPtr<T>, freed: Option<Rc<Cell<bool>>>) -> Self {
        Self {
            ptr: Some(ptr),
            freed,
            owner,
        }
    }

    pub fn null() -> Self {
        Self {
            ptr: None,
            freed: None,
            owner: ptr::null(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Whether the object is still alive
    pub fn is_valid(&self) -> bool {
        let p = match self.ptr {
            Some(p) => p,
            None => return false,
        };
        match &self.freed {
            // safety: the block is still allocated
            Some(freed) if !freed.get() => unsafe { p.is_current() },
            _ => false,
        }
    }

    fn owned_by(&self, factory: &ObjectFactory) -> bool {
        ptr::eq(self.owner, Rc::as_ptr(factory.core()))
    }

    /// Access the object
    ///
    /// Returns `None` if the reference is null, stale or belongs to another
    /// factory; in checked mode that is also reported.
    pub fn get<'f>(&self, factory: &'f ObjectFactory) -> Option<&'f T> {
        let p = match self.ptr {
            Some(p) => p,
            None => {
                factory.core().report_checked(BugTag::WeakRef, "weak_ref is null");
                return None;
            }
        };
        if !self.owned_by(factory) {
            factory
                .core()
                .report(BugTag::WeakRef, "weak_ref used with a different factory");
            return None;
        }
        if !self.is_valid() {
            factory.core().report_checked(
                BugTag::WeakRef,
                &format!("weak_ref access destroyed object {:?}", p),
            );
            return None;
        }
        // safety: alive, and only `&mut ObjectFactory` can destroy it
        Some(unsafe { p.as_ref() })
    }

    /// Temporary reference to the same object, or a null one if it is gone
    pub fn to_temp<'f>(&self, factory: &'f ObjectFactory) -> &'f TempRef<'f, T> {
        match self.ptr {
            Some(p) if self.owned_by(factory) && self.is_valid() => unsafe { factory.get_temp_ref(p) },
            _ => factory.null_temp_ref(),
        }
    }

    /// The (possibly stale) object pointer
    #[inline]
    pub fn obj_ptr(&self) -> Option<ObjPtr<T>> {
        self.ptr
    }

    /// The (possibly stale) value pointer, null for a null reference
    pub fn as_ptr(&self) -> *const T {
        match self.ptr {
            Some(p) => p.as_ptr(),
            None => ptr::null(),
        }
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            freed: self.freed.clone(),
            owner: self.owner,
        }
    }
}

impl<T> Default for WeakRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for WeakRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> Eq for WeakRef<T> {}

impl<T> Debug for WeakRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRef")
            .field("ptr", &self.ptr)
            .field("block_freed", &self.freed.as_ref().map(|x| x.get()))
            .finish()
    }
}
