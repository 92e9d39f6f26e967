use std::thread;

use brk_heap::{Heap, HeapPtr, Provenance};
use snafu::{OptionExt as _, ResultExt as _, Whatever, ensure_whatever};

use crate::steps::Steps;

fn allocate(heap: &Heap, worker: usize) -> Option<HeapPtr> {
    let here = Provenance::caller();
    match worker % 4 {
        0 => heap.allocate_debug(500, here),
        1 => heap.fill_debug(501, 1, here),
        2 => heap.resize_debug(None, 502, here),
        _ => heap.allocate_debug(5005, here),
    }
}

/// Allocates one block per thread, then releases each block from another
/// thread.
pub(crate) fn run(
    heap: &Heap,
    steps: &mut Steps,
    threads: usize,
    dump: bool,
) -> Result<(), Whatever> {
    steps.begin("allocate and release from multiple threads");
    let before = heap.stats().used_count;
    if dump {
        println!("BEFORE:\n{}", heap.dump_diagnostics());
    }

    let ptrs = thread::scope(|s| {
        let handles = (0..threads)
            .map(|worker| {
                thread::Builder::new()
                    .name(format!("alloc-{worker}"))
                    .spawn_scoped(s, move || allocate(heap, worker))
                    .whatever_context("failed to spawn thread")
            })
            .collect::<Result<Vec<_>, Whatever>>()?;
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .ok()
                    .flatten()
                    .whatever_context("allocation thread failed")
            })
            .collect::<Result<Vec<_>, Whatever>>()
    })?;

    let used = heap.stats().used_count;
    ensure_whatever!(
        used == before + threads,
        "expected {} used blocks, found {used}",
        before + threads
    );
    if dump {
        println!("AFTER:\n{}", heap.dump_diagnostics());
    }

    thread::scope(|s| {
        for (worker, ptr) in ptrs.into_iter().enumerate() {
            thread::Builder::new()
                .name(format!("free-{worker}"))
                .spawn_scoped(s, move || heap.release(ptr))
                .whatever_context("failed to spawn thread")?;
        }
        Ok::<_, Whatever>(())
    })?;

    let used = heap.stats().used_count;
    ensure_whatever!(used == before, "expected {before} used blocks, found {used}");
    heap.validate().whatever_context("heap is invalid after threaded round")?;
    steps.pass();
    Ok(())
}
