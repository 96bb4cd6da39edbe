//! Reference-counted resource handles.

use crate::error::{GpuError, Result};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Slot<T> {
    retired: AtomicBool,
    value: T,
}

/// Shared handle to a runtime object.
///
/// Clones share one object. Once any clone calls [`Handle::retire`], further
/// [`Handle::acquire`] calls fail with [`GpuError::HandleRetired`]; the object
/// itself lives until the last clone is dropped.
pub struct Handle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(Slot {
                retired: AtomicBool::new(false),
                value,
            }),
        }
    }

    /// Borrow the object, failing if it was retired.
    pub fn acquire(&self) -> Result<&T> {
        if self.is_retired() {
            return Err(GpuError::HandleRetired(short_type_name::<T>()));
        }
        Ok(&self.slot.value)
    }

    /// Mark the object as no longer usable through any handle.
    ///
    /// Returns `true` for the call that performed the retirement.
    pub fn retire(&self) -> bool {
        !self.slot.retired.swap(true, Ordering::AcqRel)
    }

    /// Retire the object and give up this handle.
    ///
    /// The object is destroyed once the remaining clones are dropped. Releasing
    /// an already retired object fails with [`GpuError::HandleRetired`].
    pub fn release(self) -> Result<()> {
        if self.retire() {
            Ok(())
        } else {
            Err(GpuError::HandleRetired(short_type_name::<T>()))
        }
    }

    pub fn is_retired(&self) -> bool {
        self.slot.retired.load(Ordering::Acquire)
    }

    /// Number of live handles to this object.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

/// Unchecked access for code paths that already hold a live handle.
impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("retired", &self.is_retired())
            .field("value", &self.slot.value)
            .finish()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Texture(u32);

    #[test]
    fn acquire_fails_after_retire() {
        let handle = Handle::new(Texture(7));
        let other = handle.clone();
        assert_eq!(other.acquire().unwrap().0, 7);

        assert!(handle.retire());
        assert!(!other.retire());

        match other.acquire() {
            Err(GpuError::HandleRetired(name)) => assert_eq!(name, "Texture"),
            result => panic!("unexpected {result:?}"),
        }
    }

    #[test]
    fn release_twice_is_refused() {
        let handle = Handle::new(Texture(3));
        let other = handle.clone();
        handle.release().unwrap();
        assert!(other.is_retired());
        assert_eq!(other.ref_count(), 1);
        assert!(matches!(other.release(), Err(GpuError::HandleRetired(_))));
    }

    #[test]
    fn clones_share_one_object() {
        let handle = Handle::new(Texture(1));
        let other = handle.clone();
        assert!(handle.ptr_eq(&other));
        assert_eq!(handle.ref_count(), 2);
        drop(other);
        assert_eq!(handle.ref_count(), 1);
    }
}
