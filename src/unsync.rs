//! Unsynchronized plain old data cells for fast access from multiple threads

use std::cell::UnsafeCell;
use std::marker::PhantomData;

/// A view over a mutable slice that allows concurrent writes without
/// synchronization.
///
/// Used by the parallel initialization and random-search passes, where every
/// worker claims whole rows of the correspondence field and therefore only
/// ever touches its own cells. The caller is responsible for keeping the
/// written index ranges disjoint.
pub(crate) struct UnsyncCells<'a, T: Copy> {
    cells: UnsafeCell<*mut T>,
    len: usize,
    _lifetime: PhantomData<&'a mut T>,
}

impl<'a, T: Copy> UnsyncCells<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            len: slice.len(),
            cells: UnsafeCell::new(slice.as_mut_ptr()),
            _lifetime: PhantomData,
        }
    }

    /// # Safety
    ///
    /// No other thread may read or write `idx` while this call is in flight.
    #[allow(unsafe_code)]
    pub unsafe fn assign_at(&self, idx: usize, value: T) {
        assert!(idx < self.len);
        *(*self.cells.get()).add(idx) = value;
    }

    #[allow(unsafe_code)]
    pub fn read_at(&self, idx: usize) -> T {
        assert!(idx < self.len);
        unsafe { *(*self.cells.get()).add(idx) }
    }
}

#[allow(unsafe_code)]
unsafe impl<'a, T: Copy> Sync for UnsyncCells<'a, T> {}
