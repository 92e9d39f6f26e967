//! Process-wide heap.

use spin::Lazy;

use crate::heap::Heap;

static GLOBAL: Lazy<Heap> = Lazy::new(Heap::default);

/// Returns the process-wide heap.
///
/// The heap has the default geometry. Its arena is created on first use
/// and still needs [`Heap::setup`] before it can allocate.
pub fn global() -> &'static Heap {
    &GLOBAL
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_shared() {
        assert!(core::ptr::eq(global(), global()));
        global().setup().unwrap();
        let ptr = global().allocate(16).unwrap();
        assert_eq!(global().payload_size_of(ptr), 16);
        global().release(ptr);
    }
}
