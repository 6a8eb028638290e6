//! Type-erased storage slots attached to images

use std::any::Any;
use std::fmt;

/// A slot able to hold a single value of any type
///
/// Images carry several of these so that the backend, the renderer and the compositor can
/// each hang their own private data off a buffer without knowing about each other.
/// Access is single-threaded, like the rest of the output machinery.
#[derive(Default)]
pub struct DataSlot {
    value: Option<Box<dyn Any>>,
}

impl fmt::Debug for DataSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSlot")
            .field("occupied", &self.value.is_some())
            .finish()
    }
}

impl DataSlot {
    /// Create an empty slot
    pub const fn new() -> Self {
        DataSlot { value: None }
    }

    /// Whether the slot currently holds a value
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Stores `value`, dropping whatever the slot held before
    pub fn set<T: Any>(&mut self, value: T) {
        self.value = Some(Box::new(value));
    }

    /// Access the stored value, if it has type `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|value| value.downcast_ref::<T>())
    }

    /// Mutably access the stored value, if it has type `T`
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut().and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes the stored value and returns it, if it has type `T`
    ///
    /// A value of another type is left untouched.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        if !self.value.as_ref().is_some_and(|value| value.is::<T>()) {
            return None;
        }
        self.value
            .take()
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Drops the stored value, if any
    pub fn clear(&mut self) {
        self.value = None;
    }
}
