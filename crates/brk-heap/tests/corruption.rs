#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use brk_heap::{
    DESCRIPTOR_SIZE, Heap, HeapConfig, NEXT_LINK_OFFSET, PAGE_SIZE, SetupError, StateFault,
    ValidateError,
};

// Byte offset of the payload size on 64-bit targets.
#[cfg(target_pointer_width = "64")]
const SIZE_OFFSET: usize = 24;

fn test_heap() -> Heap {
    let heap = Heap::new(HeapConfig::new().with_pages(16).with_guard_seed(3));
    heap.setup().unwrap();
    heap
}

fn state_fault(heap: &Heap) -> StateFault {
    match heap.validate().unwrap_err() {
        ValidateError::InvalidState { fault, .. } => fault,
        err => panic!("unexpected error: {err}"),
    }
}

#[test]
fn payload_overrun_hits_next_guard() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    let _b = heap.allocate(100).unwrap();
    heap.write_bytes(a, 0x42, 101).unwrap();

    let err = heap.validate().unwrap_err();
    assert!(err.is_invalid_descriptor_guard(), "{err}");
}

#[test]
fn payload_underrun_hits_own_guard() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    heap.write_bytes(a.addr() - 1, 0, 1).unwrap();
    assert!(heap.validate().unwrap_err().is_invalid_descriptor_guard());
}

#[test]
fn corrupted_next_link() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    let desc = a.addr() - DESCRIPTOR_SIZE;
    let bogus = (a.addr() + 8).to_ne_bytes();
    heap.write(desc + NEXT_LINK_OFFSET, &bogus).unwrap();

    assert!(matches!(state_fault(&heap), StateFault::BrokenLink { at } if at == desc));
}

#[test]
#[cfg(target_pointer_width = "64")]
fn corrupted_size() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    let desc = a.addr() - DESCRIPTOR_SIZE;
    heap.write(desc + SIZE_OFFSET, &usize::MAX.to_ne_bytes()).unwrap();
    assert!(state_fault(&heap).is_broken_link());
}

#[test]
fn guard_pages_win_over_descriptor_guards() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    heap.write_bytes(a, 0, 200).unwrap();
    heap.write_bytes(0_usize, 0xEE, 16).unwrap();

    let err = heap.validate().unwrap_err();
    assert!(err.is_invalid_guard_pages(), "{err}");
    assert!(!heap.guard_pages().first_intact);
    assert!(heap.guard_pages().last_intact);
}

#[test]
fn last_guard_page() {
    let heap = test_heap();
    let boundary = heap.space_info().mmap_boundary;
    let original = heap.to_vec(boundary + PAGE_SIZE - 1, 1).unwrap();
    heap.write_bytes(boundary + PAGE_SIZE - 1, !original[0], 1).unwrap();
    assert!(matches!(
        heap.validate().unwrap_err(),
        ValidateError::InvalidGuardPages {
            first_intact: true,
            last_intact: false,
            ..
        }
    ));

    heap.write(boundary + PAGE_SIZE - 1, &original).unwrap();
    heap.validate().unwrap();
}

#[test]
fn reset_is_refused_until_repaired() {
    let heap = test_heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let guard = heap.to_vec(b.addr() - DESCRIPTOR_SIZE, 1).unwrap();
    heap.write_bytes(a, 0, 101).unwrap();

    let err = heap.setup().unwrap_err();
    assert!(matches!(err, SetupError::Corrupted { .. }), "{err}");
    assert_eq!(heap.stats().used_count, 2);

    heap.write(b.addr() - DESCRIPTOR_SIZE, &guard).unwrap();
    heap.setup().unwrap();
    assert_eq!(heap.stats().used_count, 0);
    assert_eq!(heap.space_info().reserved(), PAGE_SIZE);
    heap.validate().unwrap();
}
