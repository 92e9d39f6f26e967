use brk_heap::{DESCRIPTOR_SIZE, Heap, NEXT_LINK_OFFSET, SetupError, StateFault, ValidateError};
use snafu::{FromString as _, OptionExt as _, ResultExt as _, Whatever, ensure_whatever, whatever};

use crate::steps::Steps;

/// Overwrites the bytes at `addr` with `data`, hands the validation error to
/// `check`, then restores the bytes.
fn with_corruption<F>(heap: &Heap, addr: usize, data: &[u8], check: F) -> Result<(), Whatever>
where
    F: FnOnce(ValidateError) -> Result<(), Whatever>,
{
    let backup = heap
        .to_vec(addr, data.len())
        .whatever_context("cannot back up bytes")?;
    heap.write(addr, data).whatever_context("cannot corrupt bytes")?;
    let res = match heap.validate() {
        Ok(()) => Err(Whatever::without_source(format!(
            "corruption at {addr:#x} went unnoticed"
        ))),
        Err(err) => check(err),
    };
    heap.write(addr, &backup).whatever_context("cannot restore bytes")?;
    res
}

/// Damages the heap in several ways and checks that validation notices.
pub(crate) fn run(heap: &Heap, steps: &mut Steps) -> Result<(), Whatever> {
    let target = heap
        .diagnostics()
        .blocks
        .into_iter()
        .filter(|block| !block.free)
        .max_by_key(|block| block.size)
        .whatever_context("no allocated block to corrupt")?;
    let payload = target.payload.addr();
    let descriptor = target.descriptor.addr();

    steps.begin("validate detects a payload overrun");
    with_corruption(heap, payload, &vec![0; target.size + 1], |err| {
        ensure_whatever!(
            err.is_invalid_descriptor_guard(),
            "unexpected error: {err}"
        );
        Ok(())
    })?;
    steps.pass();

    steps.begin("validate detects a broken descriptor guard");
    with_corruption(heap, descriptor, &[0], |err| {
        ensure_whatever!(
            matches!(err, ValidateError::InvalidDescriptorGuard { at, .. } if at == descriptor),
            "unexpected error: {err}"
        );
        Ok(())
    })?;
    steps.pass();

    steps.begin("validate detects a broken next link");
    let bogus = (payload + 8).to_ne_bytes();
    with_corruption(heap, descriptor + NEXT_LINK_OFFSET, &bogus, |err| {
        ensure_whatever!(
            matches!(
                err,
                ValidateError::InvalidState {
                    fault: StateFault::BrokenLink { .. },
                    ..
                }
            ),
            "unexpected error: {err}"
        );
        Ok(())
    })?;
    steps.pass();

    steps.begin("validate detects overwritten guard pages");
    let guard = heap
        .to_vec(descriptor, 1)
        .whatever_context("cannot back up descriptor guard")?;
    let backup = heap
        .to_vec(0_usize, 3000)
        .whatever_context("cannot back up guard page")?;
    heap.write_bytes(0_usize, 0, 3000).whatever_context("cannot corrupt guard page")?;
    // The descriptor guard is broken too; the guard pages are reported first.
    heap.write_bytes(descriptor, 0, 1).whatever_context("cannot corrupt descriptor")?;
    let err = heap.validate().err().whatever_context("guard pages not checked")?;
    ensure_whatever!(err.is_invalid_guard_pages(), "unexpected error: {err}");
    steps.pass();

    steps.begin("setup refuses to reset a corrupted heap");
    match heap.setup() {
        Err(SetupError::Corrupted { .. }) => {}
        Err(err) => whatever!("unexpected error: {err}"),
        Ok(()) => whatever!("corrupted heap was reset"),
    }
    steps.pass();

    steps.begin("setup resets a repaired heap");
    heap.write(0_usize, &backup).whatever_context("cannot restore guard page")?;
    heap.write(descriptor, &guard).whatever_context("cannot restore descriptor")?;
    heap.setup().whatever_context("reset failed")?;
    let stats = heap.stats();
    ensure_whatever!(
        stats.used_count == 0 && stats.bytes_in_use == DESCRIPTOR_SIZE,
        "heap not empty after reset: {stats:?}"
    );
    steps.pass();

    Ok(())
}
