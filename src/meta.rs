//! Slot metadata layout and the type-tagged dispatch primitive.
//!
//! Every slot kind reserves exactly one byte, written immediately before its
//! user-data region, holding a [`TagByte`]. Because that byte always sits at
//! `user_ptr - 1` regardless of which header precedes it — headers differ in
//! size, but each one is constructed so its last byte is the tag — the
//! dispatcher can identify a slot's kind from nothing but the user pointer,
//! without knowing the full header layout: a single explicit prefix byte
//! rather than relying on struct-layout coincidences.
//!
//! This module is the `unsafe` boundary the rest of the crate builds on: it
//! is the only place that casts between raw bytes and typed slot headers.

use core::ptr::NonNull;

use crate::alignment::align_up_usize;
use crate::checksum;
use crate::config::{LARGE_ALLOCATION_ALIGN, MAX_TINY_ALLOCATION_SIZE};

/// Which of the four header shapes a tag byte identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagKind {
    GpaSlot = 0,
    GpaEarlyRelease = 1,
    SraSlot = 2,
    SraLink = 3,
}

impl TagKind {
    fn from_raw(raw: u8) -> Self {
        match raw & 0x7f {
            0 => TagKind::GpaSlot,
            1 => TagKind::GpaEarlyRelease,
            2 => TagKind::SraSlot,
            _ => TagKind::SraLink,
        }
    }
}

/// The single byte that prefixes every slot's user region. Low 7 bits are
/// the [`TagKind`]; the high bit is the free/allocated flag, a packing
/// decision not dictated by the source material but consistent with it (see
/// `DESIGN.md`).
#[derive(Clone, Copy)]
pub struct TagByte(u8);

impl TagByte {
    pub fn pack(kind: TagKind, is_free: bool) -> Self {
        let bit = if is_free { 0x80 } else { 0 };
        TagByte(kind as u8 | bit)
    }

    pub fn kind(self) -> TagKind {
        TagKind::from_raw(self.0)
    }

    pub fn is_free(self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// Read the tag byte immediately below a user pointer.
///
/// # Safety
/// `user_ptr` must point one byte past a previously-written [`TagByte`].
pub unsafe fn read_tag(user_ptr: NonNull<u8>) -> TagByte {
    let tag_ptr = user_ptr.as_ptr().sub(1);
    TagByte(unsafe { tag_ptr.read() })
}

/// Write the tag byte immediately below a user pointer.
///
/// # Safety
/// The byte at `user_ptr - 1` must be valid to write (i.e. owned by the slot
/// being constructed).
pub unsafe fn write_tag(user_ptr: NonNull<u8>, tag: TagByte) {
    let tag_ptr = user_ptr.as_ptr().sub(1);
    unsafe { tag_ptr.write(tag.0) };
}

unsafe fn set_free_bit(user_ptr: NonNull<u8>, is_free: bool) {
    let tag = unsafe { read_tag(user_ptr) };
    let kind = tag.kind();
    unsafe { write_tag(user_ptr, TagByte::pack(kind, is_free)) };
}

/// A GPA-managed slot living inside the coalesced heap.
///
/// Laid out so that the tag byte (not a field of this struct — see module
/// docs) sits at `data - 1`, and `data == header_ptr + GAP_BEFORE_DATA`.
/// `GAP_BEFORE_DATA` is rounded up to `LARGE_ALLOCATION_ALIGN`, not just
/// `size_of::<Self>() + 1`, so that `data` lands on an aligned address
/// whenever `header_ptr` does (every header address in the address ring is
/// aligned by induction: the first one explicitly, and each subsequent one
/// at `data + size` with `size` itself a multiple of the alignment). The
/// bytes between the struct's real fields and the tag byte are unused
/// padding.
#[repr(C)]
pub struct GpaSlotHeader {
    pub size: usize,
    pub data: NonNull<u8>,
    pub next: Option<NonNull<GpaSlotHeader>>,
    pub prev: Option<NonNull<GpaSlotHeader>>,
    pub next_bigger_free: Option<NonNull<GpaSlotHeader>>,
    pub next_smaller_free: Option<NonNull<GpaSlotHeader>>,
    pub time_to_checksum_check: u16,
    pub checksum: u32,
    /// How far the raw chunk base had to be advanced to meet `LARGE_ALIGN`.
    /// Only meaningful on the first slot of a chunk.
    pub right_adjustment: u32,
    /// Whether the backing chunk was obtained from the growth callback (and
    /// so must be released at teardown). Only meaningful on the first slot
    /// of a chunk.
    pub memory_is_owned: bool,
}

impl GpaSlotHeader {
    pub const GAP_BEFORE_DATA: usize =
        align_up_usize(core::mem::size_of::<GpaSlotHeader>() + 1, LARGE_ALLOCATION_ALIGN);

    pub fn is_free(&self) -> bool {
        unsafe { read_tag(self.data) }.is_free()
    }

    pub fn set_free(&self, is_free: bool) {
        unsafe { set_free_bit(self.data, is_free) };
    }

    /// # Safety
    /// `header_ptr` must point to a writable region of at least
    /// `GAP_BEFORE_DATA + size` bytes, and `data` must equal
    /// `header_ptr + GAP_BEFORE_DATA`.
    pub unsafe fn init(
        header_ptr: NonNull<GpaSlotHeader>,
        data: NonNull<u8>,
        size: usize,
        is_free: bool,
        memory_is_owned: bool,
        right_adjustment: u32,
    ) {
        unsafe {
            header_ptr.as_ptr().write(GpaSlotHeader {
                size,
                data,
                next: None,
                prev: None,
                next_bigger_free: None,
                next_smaller_free: None,
                time_to_checksum_check: checksum::STEPS_PER_CHECKSUM_CHECK,
                checksum: 0,
                right_adjustment,
                memory_is_owned,
            });
            write_tag(data, TagByte::pack(TagKind::GpaSlot, is_free));
        }
        let header = unsafe { &*header_ptr.as_ptr() };
        checksum::refresh_gpa(header);
    }

    /// Recover the header from a user pointer known (via the tag byte) to
    /// be a `GPA_SLOT`.
    ///
    /// # Safety
    /// `data` must be the `data` pointer of a live `GpaSlotHeader`.
    pub unsafe fn from_data(data: NonNull<u8>) -> NonNull<GpaSlotHeader> {
        let header_ptr = data.as_ptr().sub(Self::GAP_BEFORE_DATA) as *mut GpaSlotHeader;
        unsafe { NonNull::new_unchecked(header_ptr) }
    }
}

/// A GPA slot that bypasses the coalesced heap: backed by its own dedicated
/// chunk, released directly on free.
#[repr(C)]
pub struct GpaEarlyReleaseHeader {
    pub size: usize,
    pub data: NonNull<u8>,
    /// Raw base pointer handed back to the release callback.
    pub chunk_base: NonNull<u8>,
    /// Rounded-up (power-of-two) capacity of the dedicated chunk, used by
    /// `reallocate` to decide whether a resize is a no-op.
    pub chunk_capacity: usize,
    pub checksum: u32,
    pub time_to_checksum_check: u16,
}

impl GpaEarlyReleaseHeader {
    pub const GAP_BEFORE_DATA: usize =
        align_up_usize(core::mem::size_of::<GpaEarlyReleaseHeader>() + 1, LARGE_ALLOCATION_ALIGN);

    /// # Safety
    /// Same obligations as `GpaSlotHeader::init`.
    pub unsafe fn init(
        header_ptr: NonNull<GpaEarlyReleaseHeader>,
        data: NonNull<u8>,
        chunk_base: NonNull<u8>,
        size: usize,
        chunk_capacity: usize,
    ) {
        unsafe {
            header_ptr.as_ptr().write(GpaEarlyReleaseHeader {
                size,
                data,
                chunk_base,
                chunk_capacity,
                checksum: 0,
                time_to_checksum_check: checksum::STEPS_PER_CHECKSUM_CHECK,
            });
            write_tag(data, TagByte::pack(TagKind::GpaEarlyRelease, false));
        }
        let header = unsafe { &*header_ptr.as_ptr() };
        checksum::refresh_early_release(header);
    }

    /// # Safety
    /// `data` must be the `data` pointer of a live `GpaEarlyReleaseHeader`.
    pub unsafe fn from_data(data: NonNull<u8>) -> NonNull<GpaEarlyReleaseHeader> {
        let header_ptr = data.as_ptr().sub(Self::GAP_BEFORE_DATA) as *mut GpaEarlyReleaseHeader;
        unsafe { NonNull::new_unchecked(header_ptr) }
    }
}

/// An SRA-managed fixed-size slot. The header is nothing but the tag byte —
/// the entire per-slot overhead is one byte, the rest of `MAX_TINY` is user
/// data.
pub struct SraSlotHeader;

impl SraSlotHeader {
    /// # Safety
    /// `data` must point to a writable `MAX_TINY - 1` byte region with a
    /// valid tag byte at `data - 1`.
    pub unsafe fn is_free(data: NonNull<u8>) -> bool {
        unsafe { read_tag(data) }.is_free()
    }

    /// # Safety
    /// As above.
    pub unsafe fn set_free(data: NonNull<u8>, is_free: bool) {
        unsafe { set_free_bit(data, is_free) };
    }

    /// # Safety
    /// `data` must point to the start of a fresh slot's user region.
    pub unsafe fn init(data: NonNull<u8>, is_free: bool) {
        unsafe { write_tag(data, TagByte::pack(TagKind::SraSlot, is_free)) };
    }
}

/// An SRA chain-link slot: same one-byte tag as a regular SRA slot, but its
/// data region's first pointer-width word holds the address of the next
/// chunk's first slot (closing the ring when there is only one chunk).
pub struct SraLinkHeader;

impl SraLinkHeader {
    /// # Safety
    /// `data` must point to a writable `MAX_TINY - 1` byte region.
    pub unsafe fn init(data: NonNull<u8>, next_chunk_first_slot: NonNull<u8>) {
        unsafe {
            write_tag(data, TagByte::pack(TagKind::SraLink, false));
            (data.as_ptr() as *mut *mut u8).write(next_chunk_first_slot.as_ptr());
        }
    }

    /// # Safety
    /// `data` must be the data pointer of a live `SRA_LINK` slot.
    pub unsafe fn next_chunk_first_slot(data: NonNull<u8>) -> NonNull<u8> {
        let raw = unsafe { (data.as_ptr() as *mut *mut u8).read() };
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// # Safety
    /// As above.
    pub unsafe fn set_next_chunk_first_slot(data: NonNull<u8>, next: NonNull<u8>) {
        unsafe { (data.as_ptr() as *mut *mut u8).write(next.as_ptr()) };
    }
}

/// Chunk-start metadata for an SRA backing region: the raw (pre-alignment)
/// base pointer and whether this chunk must be released at teardown. Placed
/// at the very start of the chunk, never addressed via a user pointer (so it
/// carries no tag byte).
///
/// Padded to exactly `MAX_TINY_ALLOCATION_SIZE - 1` bytes so that this
/// struct plus the one-byte tag of the first tiled slot lands that slot's
/// data exactly on a `MAX_TINY_ALLOCATION_SIZE` boundary. `packed` drops the
/// struct's alignment to 1 so the explicit padding isn't rounded away by
/// `NonNull<u8>`'s natural 8-byte alignment; fields are read and written by
/// value (never borrowed), which is sound for a packed struct.
#[repr(C, packed)]
pub struct SraChunkStart {
    pub chunk_base: NonNull<u8>,
    pub must_release_on_destroy: bool,
    _padding: [u8; SraChunkStart::PADDING_LEN],
}

impl SraChunkStart {
    const PADDING_LEN: usize = MAX_TINY_ALLOCATION_SIZE
        - 1
        - core::mem::size_of::<NonNull<u8>>()
        - core::mem::size_of::<bool>();

    pub fn new(chunk_base: NonNull<u8>, must_release_on_destroy: bool) -> Self {
        SraChunkStart {
            chunk_base,
            must_release_on_destroy,
            _padding: [0u8; Self::PADDING_LEN],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_byte_round_trips_kind_and_free_bit() {
        for kind in [
            TagKind::GpaSlot,
            TagKind::GpaEarlyRelease,
            TagKind::SraSlot,
            TagKind::SraLink,
        ] {
            for free in [true, false] {
                let tag = TagByte::pack(kind, free);
                assert_eq!(tag.kind(), kind);
                assert_eq!(tag.is_free(), free);
            }
        }
    }

    #[test]
    fn gpa_slot_tag_lands_immediately_before_data() {
        let mut buf = vec![0u8; GpaSlotHeader::GAP_BEFORE_DATA + 64];
        let header_ptr =
            unsafe { NonNull::new_unchecked(buf.as_mut_ptr() as *mut GpaSlotHeader) };
        let data = unsafe {
            NonNull::new_unchecked(buf.as_mut_ptr().add(GpaSlotHeader::GAP_BEFORE_DATA))
        };
        unsafe { GpaSlotHeader::init(header_ptr, data, 64, true, false, 0) };
        let tag = unsafe { read_tag(data) };
        assert_eq!(tag.kind(), TagKind::GpaSlot);
        assert!(tag.is_free());
        let recovered = unsafe { GpaSlotHeader::from_data(data) };
        assert_eq!(recovered, header_ptr);
    }
}
