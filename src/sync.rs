use std::cell::UnsafeCell;

/// Shared mutable slice for scatter writes from parallel stages.
///
/// Every stage that uses this follows a single-writer-per-element pattern:
/// each index is written by exactly one unit of work, and no index is read
/// until the writing stage has completed (or, in the bubble phase, until the
/// arrival counter for the guarded node has been won with acquire/release
/// ordering).
pub(crate) struct SharedSlice<'a, T>(&'a [UnsafeCell<T>]);

unsafe impl<T: Send + Sync> Sync for SharedSlice<'_, T> {}
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        // UnsafeCell<T> is layout-compatible with T
        let ptr = slice as *mut [T] as *const [UnsafeCell<T>];
        Self(unsafe { &*ptr })
    }

    /// Safety: `index` must not be written concurrently by another thread.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        *self.0[index].get() = value;
    }

    /// Safety: `index` must not be under concurrent write.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> &T {
        &*self.0[index].get()
    }
}
