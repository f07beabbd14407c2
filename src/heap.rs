//! Public API: the handle an embedder actually holds.

use core::fmt;
use core::ptr::NonNull;
use std::alloc::Layout;

use crate::config::{Config, LARGE_ALLOCATION_ALIGN, MIN_LARGE_ALLOCATION_SIZE};
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, HeapError, HeapResult};
use crate::flags::HeapFlags;
use crate::lock::Lock;
use crate::meta::GpaSlotHeader;

/// Everything a public operation needs under the single allocator lock:
/// the resolved configuration (mutable via `set_max_*_slot_checks` and the
/// heavy-debug toggle) and the dispatcher owning GPA/SRA/growth state.
struct Inner {
    cfg: Config,
    dispatcher: Dispatcher,
}

/// A heap instance over either a caller-supplied region (`create_in`) or a
/// region this crate obtained from the host allocator on the caller's
/// behalf (`create`).
pub struct Heap {
    inner: Lock<Inner>,
    self_owned_region: Option<(NonNull<u8>, Layout)>,
}

// SAFETY: all mutable access to `Dispatcher`'s raw pointers is serialised by
// the `Lock` wrapping it; nothing reaches a `Dispatcher` except through a
// `LockGuard`.
unsafe impl Send for Dispatcher {}

// SAFETY: `self_owned_region` is read only in `create`/`Drop`, never aliased
// across threads; all other state lives behind `Lock`, which is itself
// `Send + Sync` whenever its contents are `Send`.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Build an allocator over a region the caller owns and will keep alive
    /// for the lifetime of the returned `Heap`.
    pub fn create_in(region: NonNull<u8>, region_len: usize, flags: HeapFlags) -> HeapResult<Self> {
        let cfg = Config::from_flags(flags).map_err(HeapError::InvalidConfiguration)?;
        let need = GpaSlotHeader::GAP_BEFORE_DATA + MIN_LARGE_ALLOCATION_SIZE;
        if region_len < need {
            return Err(HeapError::InvalidConfiguration(ConfigError::RegionTooSmall {
                have: region_len,
                need,
            }));
        }
        let mut dispatcher = Dispatcher::new(&cfg);
        dispatcher.gpa.init_region(region, region_len, false);
        crate::diag_info!("heap created over a {}-byte caller-owned region", region_len);

        let assume_thread_safe = flags.contains(HeapFlags::ASSUME_THREAD_SAFE_USAGE);
        Ok(Heap {
            inner: Lock::new(Inner { cfg, dispatcher }, assume_thread_safe),
            self_owned_region: None,
        })
    }

    /// Build an allocator over a fresh region obtained from the host
    /// allocator, owned by the returned `Heap` and released on `Drop`.
    pub fn create(size: usize, flags: HeapFlags) -> HeapResult<Self> {
        let layout = Layout::from_size_align(size, LARGE_ALLOCATION_ALIGN)
            .map_err(|_| HeapError::AllocationFailure)?;
        let raw = unsafe { std::alloc::alloc(layout) };
        let region = NonNull::new(raw).ok_or(HeapError::AllocationFailure)?;
        let mut heap = Self::create_in(region, size, flags)?;
        heap.self_owned_region = Some((region, layout));
        Ok(heap)
    }

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.acquire();
        let Inner { cfg, dispatcher } = &mut *inner;
        dispatcher.malloc(cfg, size)
    }

    pub fn free(&self, p: NonNull<u8>) {
        let mut inner = self.inner.acquire();
        let Inner { cfg, dispatcher } = &mut *inner;
        dispatcher.free(cfg, p);
    }

    /// `None` input behaves as `malloc`; `size == 0` behaves as `free`,
    /// returning `None`.
    pub fn realloc(&self, p: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        match (p, size) {
            (None, size) => self.malloc(size),
            (Some(ptr), 0) => {
                self.free(ptr);
                None
            }
            (Some(ptr), size) => {
                let mut inner = self.inner.acquire();
                let Inner { cfg, dispatcher } = &mut *inner;
                dispatcher.realloc(cfg, ptr, size)
            }
        }
    }

    pub fn set_request_mechanism(&self, cb: impl FnMut(usize) -> Option<NonNull<u8>> + 'static) {
        self.inner.acquire().dispatcher.growth.set_request(cb);
    }

    pub fn set_release_mechanism(&self, cb: impl FnMut(NonNull<u8>) + 'static) {
        self.inner.acquire().dispatcher.growth.set_release(cb);
    }

    pub fn set_max_gpa_slot_checks(&self, n: usize) {
        self.inner.acquire().cfg.max_gpa_slot_checks_before_oom = n;
    }

    pub fn set_max_sra_slot_checks(&self, n: usize) {
        self.inner.acquire().cfg.max_sra_slot_checks_before_oom = n;
    }

    pub fn enable_heavy_debug_checks(&self) {
        self.inner.acquire().cfg.flags.insert(HeapFlags::HEAVY_DEBUG_CORRUPTION_CHECKS);
    }

    pub fn disable_heavy_debug_checks(&self) {
        self.inner.acquire().cfg.flags.remove(HeapFlags::HEAVY_DEBUG_CORRUPTION_CHECKS);
    }

    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.acquire();
        crate::dump::dump(w, &inner.dispatcher)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        {
            let mut inner = self.inner.acquire();
            crate::destructor::destroy(&mut inner.dispatcher);
        }
        if let Some((region, layout)) = self.self_owned_region {
            unsafe { std::alloc::dealloc(region.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_undersized_region() {
        let mut buf = [0u8; 4];
        let region = unsafe { NonNull::new_unchecked(buf.as_mut_ptr()) };
        let result = Heap::create_in(region, buf.len(), HeapFlags::default());
        assert!(matches!(
            result,
            Err(HeapError::InvalidConfiguration(ConfigError::RegionTooSmall { .. }))
        ));
    }

    #[test]
    fn basic_alloc_free_alloc_reuses_address() {
        let heap = Heap::create(8192, HeapFlags::default()).unwrap();
        let p1 = heap.malloc(128).unwrap();
        let _p2 = heap.malloc(128).unwrap();
        heap.free(p1);
        let p3 = heap.malloc(128).unwrap();
        assert_eq!(p1, p3);
    }

    #[test]
    fn realloc_null_is_malloc_and_zero_is_free() {
        let heap = Heap::create(8192, HeapFlags::default()).unwrap();
        let p = heap.realloc(None, 64).unwrap();
        assert!(heap.realloc(Some(p), 0).is_none());
    }
}
