//! Embedder-supplied callbacks for obtaining and releasing backing memory,
//! plus the sizing formulas the dispatcher uses to decide how much to ask
//! for on OOM.

use core::ptr::NonNull;

use crate::config::{LARGE_ALLOCATION_ALIGN, MAX_TINY_ALLOCATION_SIZE, MIN_NEW_MEM_REQUEST_SIZE};
use crate::meta::GpaSlotHeader;

pub type RequestMemoryFn = dyn FnMut(usize) -> Option<NonNull<u8>>;
pub type ReleaseMemoryFn = dyn FnMut(NonNull<u8>);

/// Holds the two optional embedder callbacks. Either may be absent; absence
/// of `request` disables both GPA early-release and growth-on-OOM.
#[derive(Default)]
pub struct GrowthProtocol {
    request: Option<Box<RequestMemoryFn>>,
    release: Option<Box<ReleaseMemoryFn>>,
}

impl GrowthProtocol {
    pub fn new() -> Self {
        GrowthProtocol {
            request: None,
            release: None,
        }
    }

    pub fn set_request(&mut self, cb: impl FnMut(usize) -> Option<NonNull<u8>> + 'static) {
        self.request = Some(Box::new(cb));
    }

    pub fn set_release(&mut self, cb: impl FnMut(NonNull<u8>) + 'static) {
        self.release = Some(Box::new(cb));
    }

    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }

    /// Borrow the request callback for components (GPA's early-release path)
    /// that need to call it directly rather than through [`request`].
    pub fn request_fn(&mut self) -> Option<&mut RequestMemoryFn> {
        self.request.as_deref_mut()
    }

    /// Disjoint borrows of the two callback slots, for call sites that need
    /// to pass both at once (e.g. GPA reallocate, which may both allocate a
    /// replacement slot and release the old one in the same call).
    pub fn split_mut(&mut self) -> (Option<&mut RequestMemoryFn>, &mut Option<Box<ReleaseMemoryFn>>) {
        (self.request.as_deref_mut(), &mut self.release)
    }

    /// Ask for at least `min_size` bytes. The first `size_of::<usize>()`
    /// bytes of a successful grant encode the actually-granted capacity;
    /// those bytes belong to the returned buffer and are fair game for the
    /// allocator to overwrite immediately afterwards (by installing a slot
    /// header over them).
    pub fn request(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let cb = self.request.as_mut()?;
        let ptr = cb(min_size)?;
        let granted = unsafe { (ptr.as_ptr() as *const usize).read_unaligned() };
        Some((ptr, granted.max(min_size)))
    }

    pub fn release(&mut self, ptr: NonNull<u8>) {
        if let Some(cb) = self.release.as_mut() {
            cb(ptr);
        }
    }
}

/// Bytes to request from the growth callback on a GPA OOM: enough for the
/// padded request itself, the minimum growth chunk size, and the largest
/// populated bucket's size class, plus room for a header and alignment
/// slop.
pub fn gpa_request_size(padded_size: usize, largest_bucket_size: usize) -> usize {
    let base = padded_size.max(MIN_NEW_MEM_REQUEST_SIZE).max(largest_bucket_size);
    base + GpaSlotHeader::GAP_BEFORE_DATA + LARGE_ALLOCATION_ALIGN - 1
}

/// Bytes to request (whether from the growth callback directly, or via a
/// GPA allocation when `sma_request_mem_from_gpa` is set) on an SRA OOM.
pub fn sra_request_size(min_size: usize) -> usize {
    min_size.max(MAX_TINY_ALLOCATION_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, Layout};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn request_reads_granted_capacity_from_first_word() {
        let mut gp = GrowthProtocol::new();
        gp.set_request(|min_size| {
            let layout = Layout::from_size_align(min_size.max(64), 8).unwrap();
            let ptr = unsafe { alloc(layout) };
            unsafe { (ptr as *mut usize).write(min_size) };
            Some(unsafe { NonNull::new_unchecked(ptr) })
        });
        let (_, granted) = gp.request(256).unwrap();
        assert_eq!(granted, 256);
    }

    #[test]
    fn release_invokes_installed_callback() {
        let mut gp = GrowthProtocol::new();
        let called = Rc::new(Cell::new(false));
        let called2 = called.clone();
        gp.set_release(move |_| called2.set(true));
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = unsafe { NonNull::new_unchecked(alloc(layout)) };
        gp.release(ptr);
        assert!(called.get());
    }

    #[test]
    fn no_request_callback_means_no_growth() {
        let gp = GrowthProtocol::new();
        assert!(!gp.has_request());
    }
}
