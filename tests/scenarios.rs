//! Integration scenarios exercising the allocator end-to-end through the
//! public `Heap` handle, plus the cross-cutting Laws from the invariants
//! this crate is built to uphold. Unit-level invariant checks (ring
//! integrity after one operation, bucket math, checksum fold) live next to
//! the modules they cover; this file only checks externally observable
//! behaviour across a sequence of calls.

use std::alloc::{alloc, Layout};
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use virtheap::meta::GpaSlotHeader;
use virtheap::{Heap, HeapFlags};

#[test]
fn basic_alloc_free_alloc() {
    let heap = Heap::create(8192, HeapFlags::default()).unwrap();
    let p1 = heap.malloc(128).unwrap();
    let p2 = heap.malloc(128).unwrap();
    assert_eq!(
        p2.as_ptr() as usize - p1.as_ptr() as usize,
        128 + GpaSlotHeader::GAP_BEFORE_DATA
    );
    heap.free(p1);
    let p3 = heap.malloc(128).unwrap();
    assert_eq!(p1, p3);
}

#[test]
fn best_fit_split_reuses_the_freed_slot_of_matching_size() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let a = heap.malloc(40).unwrap(); // pads to 64
    let _b = heap.malloc(300).unwrap(); // pads to 320
    let c = heap.malloc(90).unwrap(); // pads to 128
    let _d = heap.malloc(200).unwrap(); // pads to 256
    heap.free(a);
    heap.free(c);
    // A request that pads to 64 bytes has exactly one candidate among the
    // two freed slots (a), since c padded to a different size class.
    let e = heap.malloc(10).unwrap();
    assert_eq!(e, a);
}

#[test]
fn in_place_grow_absorbs_a_freed_neighbour() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let p = heap.malloc(128).unwrap();
    let next = heap.malloc(64).unwrap();
    heap.free(next);
    let grown = heap.realloc(Some(p), 192).unwrap();
    assert_eq!(grown, p);
}

#[test]
fn grow_without_a_free_neighbour_moves_the_allocation() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let p = heap.malloc(64).unwrap();
    let _blocker = heap.malloc(32).unwrap();
    let grown = heap.realloc(Some(p), 256).unwrap();
    assert_ne!(grown, p);
    assert!(grown.as_ptr() as usize > p.as_ptr() as usize);
}

#[test]
fn freeing_a_run_of_neighbours_coalesces_back_into_one_slot() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let first = heap.malloc(32).unwrap();
    let slots: Vec<_> = std::iter::once(first)
        .chain((0..4).map(|_| heap.malloc(32).unwrap()))
        .collect();
    for s in &slots {
        heap.free(*s);
    }
    // Five 64-byte (padded) slots coalesced back together host a single
    // allocation bigger than any one of the five originals on their own.
    let big = heap.malloc(5 * 32 + 3 * GpaSlotHeader::GAP_BEFORE_DATA).unwrap();
    assert_eq!(big, first);
}

#[test]
fn oom_triggers_growth_exactly_once_then_serves_from_the_donated_chunk() {
    // A 256-byte region has well under 768 usable bytes (the padded size of
    // a 700-byte request), so the very first malloc must grow the heap.
    let heap = Heap::create(256, HeapFlags::default()).unwrap();
    let calls = Rc::new(Cell::new(0usize));
    let calls2 = calls.clone();
    heap.set_request_mechanism(move |min_size| {
        calls2.set(calls2.get() + 1);
        let want = min_size.max(16 * 1024);
        let layout = Layout::from_size_align(want, 64).unwrap();
        let ptr = unsafe { alloc(layout) };
        unsafe { (ptr as *mut usize).write(want) };
        NonNull::new(ptr)
    });

    let p = heap.malloc(700).unwrap();
    assert_eq!(calls.get(), 1);
    let q = heap.malloc(700).unwrap();
    assert_eq!(calls.get(), 1);
    assert_ne!(p, q);
}

#[test]
fn oom_without_a_growth_callback_returns_none() {
    let heap = Heap::create(512, HeapFlags::default()).unwrap();
    assert!(heap.malloc(4096).is_none());
}

#[test]
fn law_alignment_gpa_and_sra_returns_are_aligned() {
    let heap = Heap::create(16384, HeapFlags::default()).unwrap();
    let gpa = heap.malloc(256).unwrap();
    assert_eq!(gpa.as_ptr() as usize % 64, 0);
    let sra = heap.malloc(4).unwrap();
    assert_eq!(sra.as_ptr() as usize % 64, 0);
}

#[test]
#[should_panic(expected = "double free")]
fn law_double_free_aborts_with_safety_checks_enabled() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let p = heap.malloc(64).unwrap();
    heap.free(p);
    heap.free(p);
}

#[test]
fn law_realloc_identity_same_padded_size_returns_same_pointer() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let p = heap.malloc(64).unwrap();
    let p2 = heap.realloc(Some(p), 64).unwrap();
    assert_eq!(p, p2);
}

#[test]
fn law_realloc_null_is_malloc_and_zero_is_free() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let p = heap.realloc(None, 64).unwrap();
    assert!(heap.realloc(Some(p), 0).is_none());
}

#[test]
fn dump_reports_the_slots_we_just_made() {
    let heap = Heap::create(4096, HeapFlags::default()).unwrap();
    let _p = heap.malloc(128).unwrap();
    let mut out = String::new();
    heap.dump(&mut out).unwrap();
    assert!(out.contains("allocator dump"));
    assert!(out.contains("total=1"));
}

#[test]
fn concurrent_allocation_from_multiple_threads_stays_consistent() {
    let heap = Arc::new(Heap::create(1 << 20, HeapFlags::default()).unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let heap = Arc::clone(&heap);
        let seen = Arc::clone(&seen);
        handles.push(std::thread::spawn(move || {
            let mut local = Vec::new();
            for _ in 0..200 {
                let p = heap.malloc(48).unwrap();
                local.push(p);
            }
            for p in local.drain(..) {
                heap.free(p);
            }
            seen.lock().unwrap().push(());
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), 4);
}
