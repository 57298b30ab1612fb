//! A map keyed by type, used by plugins to pass values along a transaction
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

/// Stores at most one value per type
#[derive(Default)]
pub struct TypeMap {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMap")
            .field("len", &self.map.len())
            .finish()
    }
}

impl TypeMap {
    /// empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// insert `val`, returning the previous value of the same type
    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(val))
            .and_then(|prev| prev.downcast().ok().map(|boxed| *boxed))
    }

    /// get a ref to the value stored for `T`
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|val| val.downcast_ref())
    }

    /// get a mutable ref to the value stored for `T`
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|val| val.downcast_mut())
    }

    /// remove the value stored for `T`
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|val| val.downcast().ok().map(|boxed| *boxed))
    }
}
