//! The General-Purpose Allocator: best-fit search, splitting, coalescing,
//! and the early-release bypass for large requests.

use core::ptr::NonNull;

use crate::alignment::{align_up_usize, round_to_power_of_2};
use crate::checksum;
use crate::config::{Config, LARGE_ALLOCATION_ALIGN, MIN_LARGE_ALLOCATION_SIZE};
use crate::free_list::FreeList;
use crate::meta::{GpaEarlyReleaseHeader, GpaSlotHeader, TagKind, read_tag};

type SlotPtr = NonNull<GpaSlotHeader>;
type RequestMemory<'a> = Option<&'a mut dyn FnMut(usize) -> Option<NonNull<u8>>>;
type ReleaseMemory<'a> = &'a mut dyn FnMut(NonNull<u8>);

unsafe fn h(s: SlotPtr) -> &'static mut GpaSlotHeader {
    unsafe { &mut *s.as_ptr() }
}

pub struct Gpa {
    /// Anchor into the address ring; any live GPA slot. `None` means the
    /// GPA owns no memory yet.
    address_anchor: Option<SlotPtr>,
    free_list: FreeList,
}

impl Gpa {
    pub fn new(strategy: crate::flags::BucketStrategy, num_buckets: usize) -> Self {
        Gpa {
            address_anchor: None,
            free_list: FreeList::new(strategy, num_buckets),
        }
    }

    pub fn has_memory(&self) -> bool {
        self.address_anchor.is_some()
    }

    /// The stored size of a live GPA slot, identified by its user pointer.
    pub fn slot_size(&self, data: NonNull<u8>) -> usize {
        unsafe { h(GpaSlotHeader::from_data(data)) }.size
    }

    /// `max(MIN_LARGE, size + padding_lines * LARGE_ALIGN)` rounded up to
    /// `LARGE_ALIGN`.
    pub fn pad_size(cfg: &Config, raw_size: usize) -> usize {
        let padded = raw_size + cfg.padding_lines(raw_size) * LARGE_ALLOCATION_ALIGN;
        let padded = padded.max(MIN_LARGE_ALLOCATION_SIZE);
        align_up_usize(padded, LARGE_ALLOCATION_ALIGN)
    }

    /// Install the first GPA slot over a freshly obtained or caller-owned
    /// region. `region` must be at least `GpaSlotHeader::GAP_BEFORE_DATA +
    /// MIN_LARGE_ALLOCATION_SIZE` bytes, 8-byte aligned at minimum.
    pub fn init_region(&mut self, region: NonNull<u8>, region_len: usize, owned: bool) {
        self.donate(region, region_len, owned);
    }

    /// Splice a freshly donated chunk into the address ring as one big free
    /// slot, aligning the base up to `LARGE_ALIGN` first, then coalesce (a
    /// no-op unless the new chunk happens to be address-contiguous with an
    /// existing one).
    pub fn donate(&mut self, chunk_base: NonNull<u8>, chunk_len: usize, owned: bool) {
        let raw = chunk_base.as_ptr() as usize;
        let aligned = align_up_usize(raw, LARGE_ALLOCATION_ALIGN);
        let right_adjustment = (aligned - raw) as u32;
        let gap = GpaSlotHeader::GAP_BEFORE_DATA;
        debug_assert!(chunk_len > right_adjustment as usize + gap);
        let usable = chunk_len - right_adjustment as usize - gap;

        let header_ptr = aligned as *mut GpaSlotHeader;
        let data = unsafe { NonNull::new_unchecked((header_ptr as *mut u8).add(gap)) };
        let header_nn = unsafe { NonNull::new_unchecked(header_ptr) };
        unsafe { GpaSlotHeader::init(header_nn, data, usable, true, owned, right_adjustment) };

        match self.address_anchor {
            None => unsafe {
                h(header_nn).next = Some(header_nn);
                h(header_nn).prev = Some(header_nn);
                self.address_anchor = Some(header_nn);
            },
            Some(anchor) => unsafe {
                // Splice just before the anchor.
                let prev = h(anchor).prev.unwrap();
                h(prev).next = Some(header_nn);
                h(header_nn).prev = Some(prev);
                h(header_nn).next = Some(anchor);
                h(anchor).prev = Some(header_nn);
            },
        }
        self.free_list.add(header_nn);
        self.coalesce_with_neighbours(header_nn);
        crate::diag_info!("GPA donated a {}-byte chunk (owned={})", usable, owned);
    }

    fn are_contiguous(a: SlotPtr, b: SlotPtr) -> bool {
        let a = unsafe { h(a) };
        let b = unsafe { h(b) };
        (b.data.as_ptr() as usize)
            == (a.data.as_ptr() as usize) + a.size + GpaSlotHeader::GAP_BEFORE_DATA
    }

    /// Merge `slot` with its address-ring neighbours (next, then prev) if
    /// they are free and address-contiguous.
    fn coalesce_with_neighbours(&mut self, slot: SlotPtr) {
        unsafe {
            let next = h(slot).next.unwrap();
            if next != slot && h(next).is_free() && Self::are_contiguous(slot, next) {
                self.merge_into(slot, next);
            }
        }
        unsafe {
            let prev = h(slot).prev.unwrap();
            if prev != slot && h(prev).is_free() && Self::are_contiguous(prev, slot) {
                self.merge_into(prev, slot);
            }
        }
    }

    /// Merge `right` into `left` (both free, address-contiguous, in that
    /// order). `left` survives, growing to absorb `right`'s span.
    fn merge_into(&mut self, left: SlotPtr, right: SlotPtr) {
        self.free_list.remove(left);
        self.free_list.remove(right);
        unsafe {
            let gained = h(right).size + GpaSlotHeader::GAP_BEFORE_DATA;
            h(left).size += gained;
            let after = h(right).next.unwrap();
            h(left).next = Some(after);
            h(after).prev = Some(left);
            if self.address_anchor == Some(right) {
                self.address_anchor = Some(left);
            }
        }
        checksum::refresh_gpa(unsafe { h(left) });
        self.free_list.add(left);
        crate::diag_debug!("GPA coalesced two address-contiguous free slots");
    }

    /// Bounded best-fit search: forward exploration from the bucket's
    /// entry, then (if nothing found) backward exploration from the next
    /// bigger bucket or the globally biggest slot.
    fn find_fit(&self, size: usize, max_steps: usize) -> Option<SlotPtr> {
        if let Some(entry) = self.free_list.lookup(size) {
            let mut cursor = entry;
            for _ in 0..max_steps {
                let cur = unsafe { h(cursor) };
                if cur.size >= size {
                    return Some(cursor);
                }
                let next = cur.next_bigger_free.unwrap();
                if next == entry {
                    break;
                }
                cursor = next;
            }
        }
        if let Some(entry) = self.free_list.backward_entry(size) {
            let mut cursor = entry;
            for _ in 0..max_steps {
                let cur = unsafe { h(cursor) };
                if cur.size >= size {
                    return Some(cursor);
                }
                match cur.next_smaller_free {
                    Some(next) if next != entry => cursor = next,
                    _ => break,
                }
            }
        }
        crate::diag_warn!("GPA find_fit exhausted its slot-check budget without finding a fit");
        None
    }

    /// Split `chosen` to serve `size` bytes, or convert it wholesale to
    /// allocated if the remainder would be too small to host its own
    /// header plus a minimum slot.
    fn split_or_convert(&mut self, chosen: SlotPtr, size: usize) {
        self.free_list.remove(chosen);
        let chosen_hdr = unsafe { h(chosen) };
        let remainder = chosen_hdr.size - size;
        let min_remainder = GpaSlotHeader::GAP_BEFORE_DATA + MIN_LARGE_ALLOCATION_SIZE;
        if remainder < min_remainder {
            chosen_hdr.set_free(false);
            checksum::refresh_gpa(chosen_hdr);
            crate::diag_debug!("GPA converted a slot wholesale, remainder too small to split");
            return;
        }
        // the remainder slot's header starts right after `chosen`'s (now
        // shrunk) user region.
        let remainder_header_addr = chosen_hdr.data.as_ptr() as usize + size;
        let remainder_size = remainder - GpaSlotHeader::GAP_BEFORE_DATA;

        chosen_hdr.size = size;
        chosen_hdr.set_free(false);
        checksum::refresh_gpa(chosen_hdr);

        let remainder_header_ptr =
            unsafe { NonNull::new_unchecked(remainder_header_addr as *mut GpaSlotHeader) };
        let remainder_data = unsafe {
            NonNull::new_unchecked((remainder_header_addr as *mut u8).add(GpaSlotHeader::GAP_BEFORE_DATA))
        };
        unsafe {
            GpaSlotHeader::init(
                remainder_header_ptr,
                remainder_data,
                remainder_size,
                true,
                false,
                0,
            );
            let former_next = h(chosen).next.unwrap();
            h(chosen).next = Some(remainder_header_ptr);
            h(remainder_header_ptr).prev = Some(chosen);
            h(remainder_header_ptr).next = Some(former_next);
            h(former_next).prev = Some(remainder_header_ptr);
        }
        self.free_list.add(remainder_header_ptr);
        crate::diag_debug!("GPA split a slot, remainder size={remainder_size}");
    }

    /// Request a dedicated chunk for a large allocation that bypasses the
    /// coalesced heap entirely.
    fn try_early_release(
        &self,
        size: usize,
        request_memory: &mut dyn FnMut(usize) -> Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        let capacity = round_to_power_of_2(size + GpaEarlyReleaseHeader::GAP_BEFORE_DATA);
        let chunk_base = request_memory(capacity)?;
        let header_ptr = unsafe {
            NonNull::new_unchecked(chunk_base.as_ptr() as *mut GpaEarlyReleaseHeader)
        };
        let data = unsafe {
            NonNull::new_unchecked(chunk_base.as_ptr().add(GpaEarlyReleaseHeader::GAP_BEFORE_DATA))
        };
        unsafe { GpaEarlyReleaseHeader::init(header_ptr, data, chunk_base, size, capacity) };
        Some(data)
    }

    pub fn allocate(
        &mut self,
        cfg: &Config,
        raw_size: usize,
        max_steps: usize,
        mut request_memory: RequestMemory<'_>,
    ) -> Option<NonNull<u8>> {
        let size = Self::pad_size(cfg, raw_size);
        if size >= cfg.min_size_for_early_release {
            if let Some(cb) = request_memory.as_deref_mut() {
                if let Some(p) = self.try_early_release(size, cb) {
                    return Some(p);
                }
            }
        }
        let chosen = self.find_fit(size, max_steps)?;
        self.split_or_convert(chosen, size);
        Some(unsafe { h(chosen) }.data)
    }

    pub fn free(&mut self, cfg: &Config, data: NonNull<u8>, release_memory: ReleaseMemory<'_>) {
        let tag = unsafe { read_tag(data) };
        match tag.kind() {
            TagKind::GpaEarlyRelease => {
                let header = unsafe { GpaEarlyReleaseHeader::from_data(data) };
                checksum::validate_early_release(
                    unsafe { &*header.as_ptr() },
                    true,
                    cfg.checksums_enabled(),
                );
                release_memory(unsafe { (*header.as_ptr()).chunk_base });
            }
            TagKind::GpaSlot => {
                let slot = unsafe { GpaSlotHeader::from_data(data) };
                let hdr = unsafe { h(slot) };
                checksum::validate_gpa(hdr, true, cfg.checksums_enabled());
                if cfg.safety_checks_enabled() && hdr.is_free() {
                    crate::diag_error!("double free detected on GPA slot");
                    panic!("double free detected");
                }
                hdr.set_free(true);
                checksum::refresh_gpa(hdr);
                self.free_list.add(slot);
                self.coalesce_with_neighbours(slot);
            }
            _ => {
                crate::diag_error!("GPA free called with a non-GPA tag");
                panic!("invalid pointer passed to GPA free");
            }
        }
    }

    /// Grow a GPA slot in place by absorbing its free, address-contiguous
    /// next neighbour ("consume next"). Returns `true` on success.
    fn consume_next(&mut self, slot: SlotPtr, new_size: usize) -> bool {
        let next = unsafe { h(slot).next.unwrap() };
        if next == slot || !unsafe { h(next) }.is_free() || !Self::are_contiguous(slot, next) {
            return false;
        }
        let growth = new_size - unsafe { h(slot) }.size;
        let next_size = unsafe { h(next) }.size;
        let gap = GpaSlotHeader::GAP_BEFORE_DATA;
        if next_size + gap < growth {
            return false;
        }
        self.free_list.remove(next);
        let remainder = next_size + gap - growth;
        let min_remainder = gap + MIN_LARGE_ALLOCATION_SIZE;
        unsafe {
            if remainder < min_remainder {
                // Consume the neighbour entirely.
                let after = h(next).next.unwrap();
                h(slot).size = new_size + remainder; // absorb the slack too
                h(slot).next = Some(after);
                h(after).prev = Some(slot);
                if self.address_anchor == Some(next) {
                    self.address_anchor = Some(slot);
                }
            } else {
                let remainder_size = remainder - gap;
                let new_next_header_addr = h(slot).data.as_ptr() as usize + new_size;
                let new_next_ptr = NonNull::new_unchecked(new_next_header_addr as *mut GpaSlotHeader);
                let new_next_data =
                    NonNull::new_unchecked((new_next_header_addr as *mut u8).add(gap));
                let after = h(next).next.unwrap();
                GpaSlotHeader::init(new_next_ptr, new_next_data, remainder_size, true, false, 0);
                h(slot).size = new_size;
                h(slot).next = Some(new_next_ptr);
                h(new_next_ptr).prev = Some(slot);
                h(new_next_ptr).next = Some(after);
                h(after).prev = Some(new_next_ptr);
                if self.address_anchor == Some(next) {
                    self.address_anchor = Some(new_next_ptr);
                }
                self.free_list.add(new_next_ptr);
            }
        }
        checksum::refresh_gpa(unsafe { h(slot) });
        true
    }

    /// Shrink a GPA slot in place, splitting off a new free slot to the
    /// right unless the remainder would be under-size, in which case the
    /// slot is left unchanged.
    fn split_down(&mut self, slot: SlotPtr, new_size: usize) -> bool {
        let hdr = unsafe { h(slot) };
        let remainder = hdr.size - new_size;
        let gap = GpaSlotHeader::GAP_BEFORE_DATA;
        if remainder < gap + MIN_LARGE_ALLOCATION_SIZE {
            return false;
        }
        let remainder_header_addr = hdr.data.as_ptr() as usize + new_size;
        let remainder_size = remainder - gap;
        hdr.size = new_size;
        unsafe {
            let former_next = h(slot).next.unwrap();
            let remainder_ptr =
                NonNull::new_unchecked(remainder_header_addr as *mut GpaSlotHeader);
            let remainder_data =
                NonNull::new_unchecked((remainder_header_addr as *mut u8).add(gap));
            GpaSlotHeader::init(remainder_ptr, remainder_data, remainder_size, true, false, 0);
            h(slot).next = Some(remainder_ptr);
            h(remainder_ptr).prev = Some(slot);
            h(remainder_ptr).next = Some(former_next);
            h(former_next).prev = Some(remainder_ptr);
            self.free_list.add(remainder_ptr);
        }
        checksum::refresh_gpa(unsafe { h(slot) });
        self.coalesce_with_neighbours(unsafe { h(slot).next.unwrap() });
        true
    }

    pub fn reallocate(
        &mut self,
        cfg: &Config,
        data: NonNull<u8>,
        new_raw_size: usize,
        max_steps: usize,
        mut request_memory: RequestMemory<'_>,
        release_memory: ReleaseMemory<'_>,
    ) -> Option<NonNull<u8>> {
        let slot = unsafe { GpaSlotHeader::from_data(data) };
        let hdr = unsafe { h(slot) };
        checksum::validate_gpa(hdr, true, cfg.checksums_enabled());
        let new_size = Self::pad_size(cfg, new_raw_size);

        if new_size == hdr.size {
            return Some(data);
        }
        if new_size > hdr.size {
            if self.consume_next(slot, new_size) {
                return Some(data);
            }
            let new_ptr = self.allocate(cfg, new_raw_size, max_steps, request_memory.as_deref_mut())?;
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), new_ptr.as_ptr(), hdr.size.min(new_size));
            }
            self.free(cfg, data, release_memory);
            Some(new_ptr)
        } else {
            self.split_down(slot, new_size);
            Some(data)
        }
    }

    /// Destructor support: iterate address-ring slots, invoking `f` on each
    /// and stopping once we have walked the whole ring. Deferred-release
    /// semantics live in `destructor.rs`, which drives this.
    pub fn for_each_slot(&self, mut f: impl FnMut(SlotPtr)) {
        let Some(anchor) = self.address_anchor else {
            return;
        };
        let mut cursor = anchor;
        loop {
            let next = unsafe { h(cursor) }.next.unwrap();
            f(cursor);
            if next == anchor {
                break;
            }
            cursor = next;
        }
    }
}
