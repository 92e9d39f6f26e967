use brk_heap::{DESCRIPTOR_SIZE, Heap, HeapPtr, PAGE_SIZE, PointerKind, Provenance};
use snafu::{OptionExt as _, ResultExt as _, Whatever, ensure_whatever};

use crate::steps::Steps;

/// Sequential checks of every operation, using the provenance variants.
pub(crate) fn run(heap: &Heap, steps: &mut Steps) -> Result<(), Whatever> {
    steps.begin("setup creates the heap");
    heap.setup().whatever_context("setup failed")?;
    heap.validate().whatever_context("fresh heap is invalid")?;
    steps.pass();

    steps.begin("allocate");
    let p1 = heap
        .allocate_debug(5000, Provenance::caller())
        .whatever_context("allocate(5000) failed")?;
    ensure_whatever!(
        heap.payload_size_of(p1) == 5000,
        "wrong payload size {}",
        heap.payload_size_of(p1)
    );
    steps.pass();

    steps.begin("allocate rejects zero and oversized requests");
    let capacity = heap.space_info().capacity();
    ensure_whatever!(
        heap.allocate_debug(0, Provenance::caller()).is_none(),
        "allocate(0) returned a pointer"
    );
    ensure_whatever!(
        heap.allocate_debug(capacity + 1, Provenance::caller()).is_none(),
        "allocate({}) returned a pointer",
        capacity + 1
    );
    steps.pass();

    steps.begin("fill returns zeroed memory");
    let p3 = heap
        .fill_debug(5000, 1, Provenance::caller())
        .whatever_context("fill(5000, 1) failed")?;
    let bytes = heap.to_vec(p3, 5000).whatever_context("cannot read payload")?;
    ensure_whatever!(bytes.iter().all(|&b| b == 0), "fill left non-zero bytes");
    steps.pass();

    steps.begin("resize shrinks a block");
    let p4 = heap
        .resize_debug(p1, 500, Provenance::caller())
        .whatever_context("resize(500) failed")?;
    ensure_whatever!(heap.payload_size_of(p4) == 500, "wrong payload size");
    steps.pass();

    steps.begin("resize to zero releases");
    let stale = heap.resize_debug(p4, 0, Provenance::caller());
    ensure_whatever!(stale == Some(p4), "resize(0) did not return the pointer");
    ensure_whatever!(
        !heap.classify_pointer(p4).is_payload_start(),
        "released block still classified as payload"
    );
    steps.pass();

    steps.begin("resize of null allocates");
    let p2 = heap
        .resize_debug(None, 5000, Provenance::caller())
        .whatever_context("resize(null, 5000) failed")?;
    steps.pass();

    steps.begin("release");
    heap.release(p2);
    heap.release(p3);
    let stats = heap.stats();
    ensure_whatever!(stats.used_count == 0, "{} blocks still used", stats.used_count);
    ensure_whatever!(
        stats.bytes_in_use == DESCRIPTOR_SIZE,
        "{} bytes still in use",
        stats.bytes_in_use
    );
    steps.pass();

    steps.begin("aligned allocate");
    let p1 = heap
        .allocate_aligned_debug(3500, Provenance::caller())
        .whatever_context("allocate_aligned(3500) failed")?;
    ensure_whatever!(p1.is_aligned_to(PAGE_SIZE), "{p1} is not page aligned");
    ensure_whatever!(
        heap.allocate_aligned_debug(0, Provenance::caller()).is_none(),
        "allocate_aligned(0) returned a pointer"
    );
    heap.release(p1);
    steps.pass();

    steps.begin("aligned fill");
    let p1 = heap
        .fill_aligned_debug(5000, 1, Provenance::caller())
        .whatever_context("fill_aligned(5000, 1) failed")?;
    ensure_whatever!(p1.is_aligned_to(PAGE_SIZE), "{p1} is not page aligned");
    let bytes = heap.to_vec(p1, 5000).whatever_context("cannot read payload")?;
    ensure_whatever!(bytes.iter().all(|&b| b == 0), "fill left non-zero bytes");
    steps.pass();

    steps.begin("aligned resize");
    let p4 = heap
        .resize_aligned_debug(p1, 500, Provenance::caller())
        .whatever_context("resize_aligned(500) failed")?;
    ensure_whatever!(heap.payload_size_of(p4) == 500, "wrong payload size");
    ensure_whatever!(p4.is_aligned_to(PAGE_SIZE), "{p4} is not page aligned");
    steps.pass();

    steps.begin("aligned resize to zero releases");
    let _ = heap.resize_aligned_debug(p4, 0, Provenance::caller());
    ensure_whatever!(
        !heap.classify_pointer(p4).is_payload_start(),
        "released block still classified as payload"
    );
    steps.pass();

    steps.begin("aligned resize of null allocates");
    let p2 = heap
        .resize_aligned_debug(None, 5000, Provenance::caller())
        .whatever_context("resize_aligned(null, 5000) failed")?;
    ensure_whatever!(p2.is_aligned_to(PAGE_SIZE), "{p2} is not page aligned");
    steps.pass();

    steps.begin("statistics");
    let stats = heap.stats();
    ensure_whatever!(
        stats.total() == heap.space_info().reserved(),
        "statistics cover {} of {} bytes",
        stats.total(),
        heap.space_info().reserved()
    );
    ensure_whatever!(
        stats.largest_used == 5000,
        "largest used block is {}",
        stats.largest_used
    );
    ensure_whatever!(stats.used_count >= 1, "no used block");
    ensure_whatever!(stats.free_gap_count >= 1, "no free gap");
    ensure_whatever!(
        stats.largest_free <= stats.bytes_free,
        "largest free block exceeds free bytes"
    );
    steps.pass();

    steps.begin("pointer classification");
    let classify = |ptr: Option<HeapPtr>, expected: PointerKind| -> Result<(), Whatever> {
        let kind = heap.classify_pointer(ptr);
        ensure_whatever!(kind == expected, "expected {expected}, got {kind}");
        Ok(())
    };
    classify(None, PointerKind::Null)?;
    classify(p2.checked_add(50_000), PointerKind::OutOfHeap)?;
    classify(p2.checked_sub(DESCRIPTOR_SIZE), PointerKind::InsideDescriptor)?;
    classify(p2.checked_add(50), PointerKind::InsidePayload)?;
    let p1 = heap
        .allocate_debug(50, Provenance::caller())
        .whatever_context("allocate(50) failed")?;
    heap.release(p1);
    classify(Some(p1), PointerKind::InsideFree)?;
    classify(Some(p2), PointerKind::PayloadStart)?;
    steps.pass();

    steps.begin("payload start of an interior pointer");
    let inner = p2.checked_add(50).whatever_context("pointer overflow")?;
    ensure_whatever!(
        heap.payload_start_of(inner) == Some(p2),
        "payload start not found"
    );
    steps.pass();

    steps.begin("payload size");
    ensure_whatever!(heap.payload_size_of(p2) == 5000, "wrong payload size");
    steps.pass();

    steps.begin("diagnostics dump");
    println!("{}", heap.dump_diagnostics());
    steps.pass();

    steps.begin("validate");
    heap.validate().whatever_context("heap is invalid")?;
    steps.pass();

    Ok(())
}
