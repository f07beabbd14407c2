//! Routes `malloc`/`free`/`realloc` between SRA and GPA by size and, for
//! free/realloc, by the type tag discovered at the user pointer. Owns the
//! growth-on-OOM retry sequence.

use core::ptr::NonNull;

use crate::config::Config;
use crate::gpa::Gpa;
use crate::growth::{self, GrowthProtocol};
use crate::meta::{self, GpaEarlyReleaseHeader, TagKind};
use crate::sra::{self, Sra};

pub struct Dispatcher {
    pub gpa: Gpa,
    pub sra: Sra,
    pub growth: GrowthProtocol,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Self {
        Dispatcher {
            gpa: Gpa::new(cfg.bucket_strategy, cfg.num_buckets),
            sra: Sra::new(),
            growth: GrowthProtocol::new(),
        }
    }

    pub fn malloc(&mut self, cfg: &Config, size: usize) -> Option<NonNull<u8>> {
        self.malloc_inner(cfg, size, false)
    }

    fn malloc_inner(&mut self, cfg: &Config, size: usize, is_retry: bool) -> Option<NonNull<u8>> {
        if cfg.sra_enabled() && size <= sra::SRA_SLOT_CAPACITY {
            if let Some(p) = self.sra.allocate(cfg) {
                return Some(p);
            }
            if !is_retry && self.grow_for_sra(cfg, size) {
                return self.malloc_inner(cfg, size, true);
            }
            crate::diag_warn!("SRA allocation of {} bytes failed after growth retry", size);
            return None;
        }

        if let Some(p) = self
            .gpa
            .allocate(cfg, size, cfg.max_gpa_slot_checks_before_oom, self.growth.request_fn())
        {
            return Some(p);
        }
        if !is_retry && self.grow_for_gpa(cfg, size) {
            return self.malloc_inner(cfg, size, true);
        }
        crate::diag_warn!("GPA allocation of {} bytes failed after growth retry", size);
        None
    }

    fn grow_for_gpa(&mut self, cfg: &Config, raw_size: usize) -> bool {
        if !self.growth.has_request() {
            return false;
        }
        let padded = Gpa::pad_size(cfg, raw_size);
        let want = growth::gpa_request_size(padded, 0);
        match self.growth.request(want) {
            Some((ptr, len)) => {
                self.gpa.donate(ptr, len, true);
                crate::diag_info!("GPA grew by {} bytes after OOM", len);
                true
            }
            None => false,
        }
    }

    fn grow_for_sra(&mut self, cfg: &Config, _raw_size: usize) -> bool {
        if cfg.sma_requests_from_gpa() {
            let want = growth::sra_request_size(crate::config::MIN_NEW_MEM_REQUEST_SIZE);
            let Some(ptr) =
                self.gpa
                    .allocate(cfg, want, cfg.max_gpa_slot_checks_before_oom, self.growth.request_fn())
            else {
                return false;
            };
            let granted = self.gpa.slot_size(ptr);
            self.sra.donate(ptr, granted, false);
            crate::diag_info!("SRA grew by borrowing a {}-byte GPA slot after OOM", granted);
            true
        } else {
            if !self.growth.has_request() {
                return false;
            }
            let want = growth::sra_request_size(crate::config::MIN_NEW_MEM_REQUEST_SIZE);
            match self.growth.request(want) {
                Some((ptr, len)) => {
                    self.sra.donate(ptr, len, true);
                    crate::diag_info!("SRA grew by {} bytes after OOM", len);
                    true
                }
                None => false,
            }
        }
    }

    pub fn free(&mut self, cfg: &Config, p: NonNull<u8>) {
        let tag = unsafe { meta::read_tag(p) };
        match tag.kind() {
            TagKind::GpaSlot | TagKind::GpaEarlyRelease => {
                let (_, release) = self.growth.split_mut();
                self.gpa.free(cfg, p, &mut move |ptr| {
                    if let Some(cb) = release.as_mut() {
                        cb(ptr);
                    }
                });
            }
            TagKind::SraSlot => self.sra.free(cfg, p),
            TagKind::SraLink => {
                crate::diag_error!("free called with a chain-link pointer");
                panic!("invalid pointer passed to free");
            }
        }
    }

    pub fn realloc(&mut self, cfg: &Config, p: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let tag = unsafe { meta::read_tag(p) };
        match tag.kind() {
            TagKind::SraSlot => {
                if cfg.sra_enabled() && new_size <= sra::SRA_SLOT_CAPACITY {
                    return Some(p);
                }
                let new_ptr = self.malloc_inner(cfg, new_size, false)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        p.as_ptr(),
                        new_ptr.as_ptr(),
                        sra::SRA_SLOT_CAPACITY.min(new_size),
                    );
                }
                self.sra.free(cfg, p);
                Some(new_ptr)
            }
            TagKind::GpaSlot => {
                let (request, release) = self.growth.split_mut();
                let result = self.gpa.reallocate(
                    cfg,
                    p,
                    new_size,
                    cfg.max_gpa_slot_checks_before_oom,
                    request,
                    &mut move |ptr| {
                        if let Some(cb) = release.as_mut() {
                            cb(ptr);
                        }
                    },
                );
                if result.is_some() {
                    return result;
                }
                if self.grow_for_gpa(cfg, new_size) {
                    let (request, release) = self.growth.split_mut();
                    return self.gpa.reallocate(
                        cfg,
                        p,
                        new_size,
                        cfg.max_gpa_slot_checks_before_oom,
                        request,
                        &mut move |ptr| {
                            if let Some(cb) = release.as_mut() {
                                cb(ptr);
                            }
                        },
                    );
                }
                None
            }
            TagKind::GpaEarlyRelease => {
                let header = unsafe { GpaEarlyReleaseHeader::from_data(p) };
                let (capacity, old_size) =
                    unsafe { ((*header.as_ptr()).chunk_capacity, (*header.as_ptr()).size) };
                let rounded = crate::alignment::round_to_power_of_2(
                    new_size + GpaEarlyReleaseHeader::GAP_BEFORE_DATA,
                );
                if rounded == capacity {
                    return Some(p);
                }
                let new_ptr = self.malloc_inner(cfg, new_size, false)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(p.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
                }
                self.free(cfg, p);
                Some(new_ptr)
            }
            TagKind::SraLink => {
                crate::diag_error!("realloc called with a chain-link pointer");
                panic!("invalid pointer passed to realloc");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::HeapFlags;
    use std::alloc::{alloc, Layout};

    fn make_region(len: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(len, 64).unwrap();
        unsafe { NonNull::new_unchecked(alloc(layout)) }
    }

    #[test]
    fn small_requests_route_to_sra_large_to_gpa() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        let mut d = Dispatcher::new(&cfg);
        d.gpa.init_region(make_region(8192), 8192, true);
        d.sra.donate(make_region(4096), 4096, true);

        let tiny = d.malloc(&cfg, 8).unwrap();
        let tag = unsafe { meta::read_tag(tiny) };
        assert_eq!(tag.kind(), TagKind::SraSlot);

        let big = d.malloc(&cfg, 512).unwrap();
        let tag = unsafe { meta::read_tag(big) };
        assert_eq!(tag.kind(), TagKind::GpaSlot);
    }

    #[test]
    fn free_then_realloc_roundtrip_on_gpa_slot() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        let mut d = Dispatcher::new(&cfg);
        d.gpa.init_region(make_region(8192), 8192, true);

        let p = d.malloc(&cfg, 128).unwrap();
        let p2 = d.realloc(&cfg, p, 128).unwrap();
        assert_eq!(p, p2);
        d.free(&cfg, p2);
    }
}
