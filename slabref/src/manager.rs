//! Collections of factory objects
//!
//! [ObjectManager] keys objects by id, [ObjectSet] just keeps them. Both are
//! bound to one factory at construction and hand out weak and temporary
//! references rather than raw pointers. Objects are only destroyed through
//! the collection that created them.

use std::{fmt::Debug, hash::Hash, rc::Rc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    factory::{FactoryCore, ObjPtr, ObjectFactory},
    refs::{TempRef, WeakRef},
    report::BugTag,
};

fn same_factory(core: &Rc<FactoryCore>, factory: &ObjectFactory) -> bool {
    if Rc::ptr_eq(core, factory.core()) {
        true
    } else {
        factory
            .core()
            .report(BugTag::Factory, "collection used with a different factory");
        false
    }
}

/// Id-keyed objects
pub struct ObjectManager<Id, T> {
    map: FxHashMap<Id, ObjPtr<T>>,
    /// Keeps the object memory around even if the factory goes first
    core: Rc<FactoryCore>,
}

impl<Id: Debug, T> Debug for ObjectManager<Id, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectManager").field("map", &self.map).finish()
    }
}

impl<Id: Hash + Eq, T: 'static> ObjectManager<Id, T> {
    pub fn new(factory: &ObjectFactory) -> Self {
        Self {
            map: FxHashMap::default(),
            core: factory.core().clone(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.map.contains_key(id)
    }

    /// Create an object under `id`
    ///
    /// Returns `None` if `id` is taken or the object can't be allocated.
    pub fn create(&mut self, factory: &ObjectFactory, id: Id, value: T) -> Option<WeakRef<T>> {
        if !same_factory(&self.core, factory) || self.map.contains_key(&id) {
            return None;
        }
        let p = factory.new_obj(value)?;
        self.map.insert(id, p);
        Some(unsafe { factory.get_weak_ref(p) })
    }

    /// Destroy at the end of the frame; false if there is no such id
    pub fn destroy(&mut self, factory: &ObjectFactory, id: &Id) -> bool {
        if !same_factory(&self.core, factory) {
            return false;
        }
        match self.map.remove(id) {
            Some(p) => {
                // safety: objects in the map are only destroyed through the map
                unsafe { factory.delete_obj(p) };
                true
            }
            None => false,
        }
    }

    /// Destroy right now; false if there is no such id
    pub fn destroy_immediately(&mut self, factory: &mut ObjectFactory, id: &Id) -> bool {
        if !same_factory(&self.core, factory) {
            return false;
        }
        match self.map.remove(id) {
            Some(p) => {
                unsafe { factory.delete_obj_immediately(p) };
                true
            }
            None => false,
        }
    }

    /// Weak reference to the object under `id`, null if there is none
    pub fn try_get(&self, factory: &ObjectFactory, id: &Id) -> WeakRef<T> {
        match self.map.get(id) {
            Some(&p) if same_factory(&self.core, factory) => unsafe { factory.get_weak_ref(p) },
            _ => WeakRef::null(),
        }
    }

    pub fn try_get_temp<'f>(&self, factory: &'f ObjectFactory, id: &Id) -> &'f TempRef<'f, T> {
        match self.map.get(id) {
            Some(&p) if same_factory(&self.core, factory) => unsafe { factory.get_temp_ref(p) },
            _ => factory.null_temp_ref(),
        }
    }

    /// First object matching `pred`, in unspecified order
    pub fn find_if<P>(&self, factory: &ObjectFactory, pred: P) -> WeakRef<T>
    where
        P: FnMut(&TempRef<'_, T>) -> bool,
    {
        match self.find_ptr(factory, pred) {
            Some(p) => unsafe { factory.get_weak_ref(p) },
            None => WeakRef::null(),
        }
    }

    pub fn find_temp_if<'f, P>(&self, factory: &'f ObjectFactory, pred: P) -> &'f TempRef<'f, T>
    where
        P: FnMut(&TempRef<'_, T>) -> bool,
    {
        match self.find_ptr(factory, pred) {
            Some(p) => unsafe { factory.get_temp_ref(p) },
            None => factory.null_temp_ref(),
        }
    }

    fn find_ptr<P>(&self, factory: &ObjectFactory, mut pred: P) -> Option<ObjPtr<T>>
    where
        P: FnMut(&TempRef<'_, T>) -> bool,
    {
        if !same_factory(&self.core, factory) {
            return None;
        }
        self.map
            .values()
            .copied()
            .find(|&p| pred(unsafe { factory.get_temp_ref(p) }))
    }

    pub fn find_all_if<P>(&self, factory: &ObjectFactory, mut pred: P) -> Vec<WeakRef<T>>
    where
        P: FnMut(&TempRef<'_, T>) -> bool,
    {
        if !same_factory(&self.core, factory) {
            return Vec::new();
        }
        self.map
            .values()
            .copied()
            .filter(|&p| pred(unsafe { factory.get_temp_ref(p) }))
            .map(|p| unsafe { factory.get_weak_ref(p) })
            .collect()
    }

    pub fn for_each<F>(&self, factory: &ObjectFactory, mut f: F)
    where
        F: FnMut(&Id, &TempRef<'_, T>),
    {
        self.for_each_interruptible(factory, |id, t| {
            f(id, t);
            true
        });
    }

    /// Like [ObjectManager::for_each], stopping as soon as `f` returns false
    pub fn for_each_interruptible<F>(&self, factory: &ObjectFactory, mut f: F)
    where
        F: FnMut(&Id, &TempRef<'_, T>) -> bool,
    {
        if !same_factory(&self.core, factory) {
            return;
        }
        for (id, &p) in &self.map {
            if !f(id, unsafe { factory.get_temp_ref(p) }) {
                break;
            }
        }
    }

    /// Destroy everything at the end of the frame
    pub fn clear(&mut self, factory: &ObjectFactory) {
        if !same_factory(&self.core, factory) {
            return;
        }
        for (_, p) in self.map.drain() {
            unsafe { factory.delete_obj(p) };
        }
    }
}

/// Objects without ids
pub struct ObjectSet<T> {
    objs: FxHashSet<ObjPtr<T>>,
    core: Rc<FactoryCore>,
}

impl<T> Debug for ObjectSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectSet").field("objs", &self.objs).finish()
    }
}

impl<T: 'static> ObjectSet<T> {
    pub fn new(factory: &ObjectFactory) -> Self {
        Self {
            objs: FxHashSet::default(),
            core: factory.core().clone(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn contains(&self, w: &WeakRef<T>) -> bool {
        w.obj_ptr().map_or(false, |p| self.objs.contains(&p))
    }

    pub fn create(&mut self, factory: &ObjectFactory, value: T) -> Option<WeakRef<T>> {
        if !same_factory(&self.core, factory) {
            return None;
        }
        let p = factory.new_obj(value)?;
        self.objs.insert(p);
        Some(unsafe { factory.get_weak_ref(p) })
    }

    /// Destroy at the end of the frame; false if `w` isn't in this set
    pub fn destroy(&mut self, factory: &ObjectFactory, w: &WeakRef<T>) -> bool {
        match w.obj_ptr() {
            Some(p) if same_factory(&self.core, factory) && self.objs.remove(&p) => {
                unsafe { factory.delete_obj(p) };
                true
            }
            _ => false,
        }
    }

    pub fn destroy_immediately(&mut self, factory: &mut ObjectFactory, w: &WeakRef<T>) -> bool {
        match w.obj_ptr() {
            Some(p) if same_factory(&self.core, factory) && self.objs.remove(&p) => {
                unsafe { factory.delete_obj_immediately(p) };
                true
            }
            _ => false,
        }
    }

    pub fn for_each<F>(&self, factory: &ObjectFactory, mut f: F)
    where
        F: FnMut(&TempRef<'_, T>),
    {
        if !same_factory(&self.core, factory) {
            return;
        }
        for &p in &self.objs {
            f(unsafe { factory.get_temp_ref(p) });
        }
    }

    pub fn clear(&mut self, factory: &ObjectFactory) {
        if !same_factory(&self.core, factory) {
            return;
        }
        for p in self.objs.drain() {
            unsafe { factory.delete_obj(p) };
        }
    }
}
