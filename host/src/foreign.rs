//! Shared cells for foreign pointers with deterministic release.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

pub type ReleaseHook = Box<dyn Fn(*mut c_void) + Send + Sync>;

struct ForeignInner {
    ptr: *mut c_void,
    release: Option<ReleaseHook>,
}

// The wrapped pointer's thread affinity is the embedder's business; the cell
// itself only stores it and runs the hook once.
unsafe impl Send for ForeignInner {}
unsafe impl Sync for ForeignInner {}

impl Drop for ForeignInner {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.ptr);
        }
    }
}

/// A reference-counted foreign pointer.
///
/// This models the host's external-handle ABI: the cell owns one foreign
/// reference, and the release hook runs exactly once when the last clone is
/// dropped — the "finalizer" of the host's garbage collector, made
/// deterministic. The raw pointer must never be used past the last clone.
#[derive(Clone)]
pub struct ForeignCell(Arc<ForeignInner>);

impl ForeignCell {
    /// Wrap `ptr` with an optional release hook.
    pub fn new(ptr: *mut c_void, release: Option<ReleaseHook>) -> Self {
        ForeignCell(Arc::new(ForeignInner { ptr, release }))
    }

    /// Wrap a pointer the host does not own (no release hook).
    pub fn borrowed(ptr: *mut c_void) -> Self {
        Self::new(ptr, None)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.ptr
    }

    /// Numeric pointer value, for diagnostics only.
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.ptr as usize
    }

    /// Identity comparison (same underlying cell, not same pointee).
    pub fn same_cell(&self, other: &ForeignCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ForeignCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignCell({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn release_hook_runs_exactly_once() {
        let released = StdArc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let cell = ForeignCell::new(
            0x1000 as *mut _,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let clone_a = cell.clone();
        let clone_b = clone_a.clone();
        assert!(cell.same_cell(&clone_b));

        drop(cell);
        drop(clone_a);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(clone_b);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn borrowed_cells_have_no_hook() {
        let cell = ForeignCell::borrowed(0x2000 as *mut _);
        assert_eq!(cell.addr(), 0x2000);
        drop(cell);
    }
}
