use std::{fmt::Debug, ptr};

use crate::{
    factory::{FactoryCore, ObjPtr},
    refs::WeakRef,
    report::BugTag,
};

/// Frame-scoped reference
///
/// Lives in the factory's frame arena and borrows the factory, so it cannot be
/// kept across [ObjectFactory::on_frame_end](crate::factory::ObjectFactory::on_frame_end).
/// Access is checked against the set of objects destroyed during the current frame.
pub struct TempRef<'f, T> {
    ptr: Option<ObjPtr<T>>,
    core: &'f FactoryCore,
}

impl<'f, T> TempRef<'f, T> {
    pub(crate) fn new(core: &'f FactoryCore, ptr: Option<ObjPtr<T>>) -> Self {
        Self { ptr, core }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn is_valid(&self) -> bool {
        match self.ptr {
            Some(p) => {
                !self.core.destroyed_this_frame(p.addr(), p.generation())
                    // safety: minting requires the cell to still be allocated,
                    // and nothing can release it while the factory is borrowed
                    && unsafe { p.is_current() }
            }
            None => false,
        }
    }

    /// Access the object
    ///
    /// Returns `None` if the reference is null or its object was destroyed;
    /// in checked mode that is also reported.
    pub fn get(&self) -> Option<&'f T> {
        let p = match self.ptr {
            Some(p) => p,
            None => {
                self.core.report_checked(BugTag::TempRef, "temp_ref is null");
                return None;
            }
        };
        if !self.is_valid() {
            self.core.report_checked(
                BugTag::TempRef,
                &format!("temp_ref access destroyed object {:?}", p),
            );
            return None;
        }
        Some(unsafe { p.as_ref() })
    }

    /// Weak reference to the same object; invalid if the object is gone
    pub fn to_weak(&self) -> WeakRef<T> {
        match self.ptr {
            Some(p) => {
                let freed = if self.is_valid() {
                    self.core.freed_flag(p.header())
                } else {
                    None
                };
                WeakRef::new(self.core as *const FactoryCore, p, freed)
            }
            None => WeakRef::null(),
        }
    }

    #[inline]
    pub fn obj_ptr(&self) -> Option<ObjPtr<T>> {
        self.ptr
    }

    pub fn as_ptr(&self) -> *const T {
        match self.ptr {
            Some(p) => p.as_ptr(),
            None => ptr::null(),
        }
    }
}

impl<'f, T> Debug for TempRef<'f, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempRef").field("ptr", &self.ptr).finish()
    }
}
