//! The Small Round-Robin Allocator: fixed-size tiny allocations served from
//! one or more linked chunks, searched cursor-first.

use core::ptr::NonNull;

use crate::alignment::align_up_usize;
use crate::config::{Config, MAX_TINY_ALLOCATION_SIZE};
use crate::meta::{SraChunkStart, SraLinkHeader, SraSlotHeader, TagKind, read_tag};

/// Bytes of user data a single SRA slot can hold (the rest of `MAX_TINY` is
/// the one-byte tag).
pub const SRA_SLOT_CAPACITY: usize = MAX_TINY_ALLOCATION_SIZE - 1;

#[derive(Clone, Copy)]
struct ChunkBounds {
    first_slot: NonNull<u8>,
    last_slot: NonNull<u8>,
}

pub struct Sra {
    first_slot: Option<NonNull<u8>>,
    last_slot: Option<NonNull<u8>>,
    rr_cursor: Option<NonNull<u8>>,
    chunks: Vec<ChunkBounds>,
}

impl Sra {
    pub fn new() -> Self {
        Sra {
            first_slot: None,
            last_slot: None,
            rr_cursor: None,
            chunks: Vec::new(),
        }
    }

    pub fn has_memory(&self) -> bool {
        self.first_slot.is_some()
    }

    fn next_physical(data: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(data.as_ptr().add(MAX_TINY_ALLOCATION_SIZE)) }
    }

    /// Next regular slot after `data`, transparently following a chain link
    /// if the physically-next slot turns out to be one.
    unsafe fn get_next(&self, data: NonNull<u8>) -> NonNull<u8> {
        let candidate = Self::next_physical(data);
        let tag = unsafe { read_tag(candidate) };
        if tag.kind() == TagKind::SraLink {
            unsafe { SraLinkHeader::next_chunk_first_slot(candidate) }
        } else {
            candidate
        }
    }

    /// Align the chunk up to `MAX_TINY`, write chunk-start metadata, tile
    /// free slots, and close the last one into a chain link. Splices into
    /// the existing ring if one already exists.
    pub fn donate(&mut self, chunk_base: NonNull<u8>, chunk_len: usize, owned: bool) {
        let raw = chunk_base.as_ptr() as usize;
        let aligned = align_up_usize(raw, MAX_TINY_ALLOCATION_SIZE);
        let adjustment = aligned - raw;
        debug_assert!(chunk_len > adjustment);
        let usable = chunk_len - adjustment;
        let start_size = core::mem::size_of::<SraChunkStart>();
        debug_assert!(usable > start_size + MAX_TINY_ALLOCATION_SIZE);

        let chunk_start_ptr = aligned as *mut SraChunkStart;
        unsafe {
            chunk_start_ptr.write(SraChunkStart::new(chunk_base, owned));
        }

        // `start_size` is `MAX_TINY - 1` (see `SraChunkStart`), so
        // `slots_region_start + 1` (every slot's data pointer) lands on a
        // `MAX_TINY_ALLOCATION_SIZE` boundary.
        let slots_region_start = aligned + start_size;
        let slots_region_len = usable - start_size;
        let num_slots = slots_region_len / MAX_TINY_ALLOCATION_SIZE;
        debug_assert!(num_slots >= 1);

        let first_data =
            unsafe { NonNull::new_unchecked((slots_region_start as *mut u8).add(1)) };

        let mut cursor_addr = slots_region_start;
        for _ in 0..num_slots - 1 {
            let data = unsafe { NonNull::new_unchecked((cursor_addr as *mut u8).add(1)) };
            unsafe { SraSlotHeader::init(data, true) };
            cursor_addr += MAX_TINY_ALLOCATION_SIZE;
        }

        let link_data = unsafe { NonNull::new_unchecked((cursor_addr as *mut u8).add(1)) };
        let ring_target = self.first_slot.unwrap_or(first_data);
        unsafe { SraLinkHeader::init(link_data, ring_target) };

        if let Some(prev_last) = self.last_slot {
            unsafe { SraLinkHeader::set_next_chunk_first_slot(prev_last, first_data) };
        }

        self.chunks.push(ChunkBounds {
            first_slot: first_data,
            last_slot: link_data,
        });
        if self.first_slot.is_none() {
            self.first_slot = Some(first_data);
        }
        self.last_slot = Some(link_data);
        self.rr_cursor = Some(first_data);
        crate::diag_info!(
            "SRA donated a chunk of {} slots ({} bytes usable)",
            num_slots - 1,
            usable
        );
    }

    /// Advance the cursor, skipping chain links, until a free slot is found
    /// or the step budget runs out.
    pub fn allocate(&mut self, cfg: &Config) -> Option<NonNull<u8>> {
        let mut cursor = self.rr_cursor?;
        for _ in 0..cfg.max_sra_slot_checks_before_oom {
            if unsafe { SraSlotHeader::is_free(cursor) } {
                unsafe { SraSlotHeader::set_free(cursor, false) };
                self.rr_cursor = Some(unsafe { self.get_next(cursor) });
                return Some(cursor);
            }
            cursor = unsafe { self.get_next(cursor) };
        }
        self.rr_cursor = Some(cursor);
        crate::diag_warn!("SRA allocate exhausted its slot-check budget without finding a free slot");
        None
    }

    /// Resolved Open Question: bounds-check a pointer against the chunks we
    /// actually own before trusting its tag, since an intact tag byte alone
    /// does not prove the address is a live SRA slot.
    fn is_in_bounds(&self, data: NonNull<u8>) -> bool {
        let addr = data.as_ptr() as usize;
        self.chunks.iter().any(|c| {
            let first = c.first_slot.as_ptr() as usize;
            let last = c.last_slot.as_ptr() as usize;
            addr >= first && addr <= last && (addr - first) % MAX_TINY_ALLOCATION_SIZE == 0
        })
    }

    pub fn free(&mut self, cfg: &Config, data: NonNull<u8>) {
        if cfg.safety_checks_enabled() && !self.is_in_bounds(data) {
            crate::diag_error!("SRA free called with a pointer outside any owned chunk");
            panic!("invalid pointer passed to SRA free");
        }
        if cfg.safety_checks_enabled() && unsafe { SraSlotHeader::is_free(data) } {
            crate::diag_error!("double free detected on SRA slot");
            panic!("double free detected");
        }
        unsafe { SraSlotHeader::set_free(data, true) };
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Destructor support: yield each owned chunk's raw base pointer.
    pub fn for_each_owned_chunk(&self, mut f: impl FnMut(NonNull<u8>)) {
        for c in &self.chunks {
            let start_addr = c.first_slot.as_ptr() as usize - core::mem::size_of::<SraChunkStart>();
            let start = unsafe { &*(start_addr as *const SraChunkStart) };
            if start.must_release_on_destroy {
                f(start.chunk_base);
            }
        }
    }
}

impl Default for Sra {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::HeapFlags;
    use std::alloc::{alloc, Layout};

    fn make_chunk(len: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(len, MAX_TINY_ALLOCATION_SIZE).unwrap();
        unsafe { NonNull::new_unchecked(alloc(layout)) }
    }

    #[test]
    fn allocate_then_free_then_reallocate_reuses_slot() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        let mut sra = Sra::new();
        sra.donate(make_chunk(4096), 4096, true);
        let a = sra.allocate(&cfg).unwrap();
        let b = sra.allocate(&cfg).unwrap();
        assert_ne!(a, b);
        sra.free(&cfg, a);
        // Cursor has moved on; walking the ring eventually returns to `a`.
        let mut seen_a_again = false;
        for _ in 0..8 {
            if let Some(p) = sra.allocate(&cfg) {
                if p == a {
                    seen_a_again = true;
                    break;
                }
            }
        }
        assert!(seen_a_again);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics_with_safety_checks() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        let mut sra = Sra::new();
        sra.donate(make_chunk(4096), 4096, true);
        let a = sra.allocate(&cfg).unwrap();
        sra.free(&cfg, a);
        sra.free(&cfg, a);
    }

    #[test]
    fn donating_a_second_chunk_keeps_the_ring_closed() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        let mut sra = Sra::new();
        sra.donate(make_chunk(4096), 4096, true);
        sra.donate(make_chunk(4096), 4096, true);
        let mut count = 0;
        for _ in 0..256 {
            if sra.allocate(&cfg).is_some() {
                count += 1;
            } else {
                break;
            }
        }
        assert!(count > 0);
    }
}
