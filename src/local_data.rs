//! Type-erased fiber-local storage.
//!
//! Each fiber carries a small bag of typed slots keyed by `TypeId`. A slot
//! is default-constructed on first access, and the whole bag is deep-copied
//! into a child fiber at submission time, so later parent mutations never
//! leak into the child. Lookup is a linear scan; fibers carry a handful of
//! locals at most.

use std::any::{Any, TypeId};

/// One erased slot. Values must be `Clone` so children get a deep copy, and
/// `Send` because a snapshot may ride a remote task to another thread.
trait AnyLocal: Any + Send {
    fn clone_boxed(&self) -> Box<dyn AnyLocal>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + Send> AnyLocal for T {
    fn clone_boxed(&self) -> Box<dyn AnyLocal> {
        Box::new(self.clone())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub(crate) struct LocalData {
    slots: Vec<(TypeId, Box<dyn AnyLocal>)>,
}

impl LocalData {
    /// Pointer to the typed slot, default-constructing it on first access.
    ///
    /// The value lives behind its own box, so the pointer stays valid while
    /// further slots are added to the bag.
    pub(crate) fn slot_ptr<T>(&mut self) -> *mut T
    where
        T: Default + Clone + Send + 'static,
    {
        let key = TypeId::of::<T>();
        if let Some(idx) = self.slots.iter().position(|(id, _)| *id == key) {
            let value = self.slots[idx]
                .1
                .as_any_mut()
                .downcast_mut::<T>()
                .expect("fiber-local slot type invariant");
            return value as *mut T;
        }
        self.slots.push((key, Box::new(T::default())));
        let value = self
            .slots
            .last_mut()
            .expect("slot just pushed")
            .1
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("fiber-local slot type invariant");
        value as *mut T
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

impl Clone for LocalData {
    fn clone(&self) -> Self {
        LocalData {
            slots: self
                .slots
                .iter()
                .map(|(id, value)| (*id, value.clone_boxed()))
                .collect(),
        }
    }
}
