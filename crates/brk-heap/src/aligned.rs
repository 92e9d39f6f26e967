//! Page-aligned allocation.
//!
//! A page-aligned payload still needs its descriptor right in front of it,
//! so the descriptor of an aligned block sits `DESCRIPTOR_SIZE` bytes below
//! a page boundary. When a free block does not start there, its leading
//! bytes are cut off into a padding block:
//!
//! ```text
//!  at                     at + offset          page boundary
//!  ┌──────────┬───────────┬────────────────────┬─────────────┬──────────┐
//!  │ padding  │ padding   │ aligned descriptor │ payload     │ rest     │
//!  │ desc     │ payload   │                    │ (size)      │ (free)   │
//!  └──────────┴───────────┴────────────────────┴─────────────┴──────────┘
//! ```
//!
//! Padding blocks are marked allocated so the first-fit search never hands
//! them out. They are never exposed to callers and never carry provenance.

use crate::{
    descriptor::{DESCRIPTOR_SIZE, Provenance, RawDescriptor},
    heap::HeapState,
    space::PAGE_SIZE,
};

/// Distance from the descriptor at `at` to the first position whose payload
/// is page aligned and that leaves room for a padding descriptor.
pub(crate) const fn alignment_offset(at: usize) -> usize {
    let payload = at + DESCRIPTOR_SIZE;
    let offset = payload.next_multiple_of(PAGE_SIZE) - payload;
    if offset > 0 && offset < DESCRIPTOR_SIZE {
        offset + PAGE_SIZE
    } else {
        offset
    }
}

/// Returns `true` if a free block of `capacity` bytes whose aligned
/// descriptor lies `offset` bytes in can hold `size` aligned bytes.
///
/// Mirrors the plain acceptance test: the aligned part must either fit
/// exactly or leave room for a remainder descriptor.
pub(crate) const fn fits_aligned(capacity: usize, offset: usize, size: usize) -> bool {
    let Some(exact) = offset.checked_add(size) else {
        return false;
    };
    match capacity.checked_sub(exact) {
        Some(excess) => excess == 0 || excess == DESCRIPTOR_SIZE || excess >= 2 * DESCRIPTOR_SIZE,
        None => false,
    }
}

impl HeapState {
    /// Allocates `size` bytes with a page-aligned payload.
    pub(crate) fn allocate_aligned(
        &mut self,
        size: usize,
        provenance: Option<Provenance<'_>>,
    ) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let head = self.root?;

        let mut last = head;
        let mut cursor = Some(head);
        while let Some(at) = cursor {
            let desc = self.load(at);
            if desc.is_free() {
                let offset = alignment_offset(at);
                if fits_aligned(desc.payload_size(), offset, size) {
                    return Some(self.carve_aligned(at, offset, size, provenance));
                }
            }
            last = at;
            cursor = desc.next();
        }

        let trailing = self.trailing(last);
        let offset = alignment_offset(trailing.at);
        let extent = offset
            .checked_add(2 * DESCRIPTOR_SIZE)?
            .checked_add(size)?;
        let block = self.grow(trailing, extent)?;
        Some(self.carve_aligned(block, offset, size, provenance))
    }

    /// Cuts the free block at `at` into padding, the aligned allocation and
    /// a free remainder, and returns the aligned payload address.
    fn carve_aligned(
        &mut self,
        at: usize,
        offset: usize,
        size: usize,
        provenance: Option<Provenance<'_>>,
    ) -> usize {
        let mut block = at;
        if offset > 0 {
            let padding = self.load(at);
            let aligned_at = at + offset;
            let aligned = RawDescriptor::free(
                padding.payload_size() - offset,
                Some(at),
                padding.next(),
            );
            if let Some(next) = padding.next() {
                self.modify(next, |next| next.set_prev(Some(aligned_at)));
            }
            self.modify(at, |padding| {
                padding.set_payload_size(offset - DESCRIPTOR_SIZE);
                padding.set_next(Some(aligned_at));
                padding.set_free(false);
                padding.set_provenance(None);
            });
            self.store(aligned_at, &aligned);
            block = aligned_at;
        }

        if self.load(block).payload_size() > size {
            self.split(block, size);
        }
        self.claim(block, provenance);
        block + DESCRIPTOR_SIZE
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    const D: usize = DESCRIPTOR_SIZE;

    fn with_test_state<F>(pages: usize, test_fn: F)
    where
        F: FnOnce(&mut HeapState),
    {
        let mut state = HeapState::new(&HeapConfig::new().with_pages(pages).with_guard_seed(9));
        state.setup().unwrap();
        test_fn(&mut state);

        let blocks = state.blocks().collect::<Vec<_>>();
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].at);
            assert_eq!(pair[1].desc.prev(), Some(pair[0].at));
        }
        assert_eq!(blocks.last().unwrap().end(), state.space.current_break());
    }

    fn chain(state: &HeapState) -> Vec<(usize, usize, bool)> {
        state
            .blocks()
            .map(|block| (block.at, block.desc.payload_size(), block.desc.is_free()))
            .collect()
    }

    #[test]
    fn test_alignment_offset() {
        assert_eq!(alignment_offset(PAGE_SIZE - D), 0);
        assert_eq!(alignment_offset(PAGE_SIZE), PAGE_SIZE - D);
        assert_eq!(alignment_offset(PAGE_SIZE - D - 100), 100);
        assert_eq!(alignment_offset(PAGE_SIZE - D - 10), 10 + PAGE_SIZE);
        assert_eq!(alignment_offset(PAGE_SIZE - D - 1), 1 + PAGE_SIZE);
        assert_eq!(alignment_offset(PAGE_SIZE - 2 * D), D);
    }

    #[test]
    fn test_fits_aligned() {
        assert!(fits_aligned(300, 200, 100));
        assert!(fits_aligned(300 + D, 200, 100));
        assert!(!fits_aligned(300 + D - 1, 200, 100));
        assert!(!fits_aligned(300 + D + 1, 200, 100));
        assert!(fits_aligned(300 + 2 * D, 200, 100));
        assert!(!fits_aligned(299, 200, 100));
        assert!(!fits_aligned(usize::MAX, usize::MAX, 1));
    }

    #[test]
    fn test_aligned_allocation_grows_with_padding() {
        with_test_state(4, |state| {
            let ptr = state.allocate_aligned(3500, None).unwrap();
            assert_eq!(ptr, 2 * PAGE_SIZE);
            assert_eq!(
                chain(state),
                vec![
                    (PAGE_SIZE, PAGE_SIZE - 2 * D, false),
                    (2 * PAGE_SIZE - D, 3500, false),
                    (2 * PAGE_SIZE + 3500, 532, true),
                ]
            );
            assert_eq!(state.space.current_break(), 3 * PAGE_SIZE);
        });
    }

    #[test]
    fn test_aligned_allocation_without_padding() {
        with_test_state(4, |state| {
            // Leave a free block whose payload is already page aligned.
            let first = state.allocate(PAGE_SIZE - 2 * D, None).unwrap();
            assert_eq!(chain(state)[1], (2 * PAGE_SIZE - D, 0, true));

            let ptr = state.allocate_aligned(100, None).unwrap();
            assert_eq!(ptr, 2 * PAGE_SIZE);
            assert_eq!(chain(state)[1], (2 * PAGE_SIZE - D, 100, false));
            state.release(first);
        });
    }

    #[test]
    fn test_aligned_allocation_reuses_free_block() {
        with_test_state(8, |state| {
            let big = state.allocate(3 * PAGE_SIZE, None).unwrap();
            let guard = state.allocate(10, None).unwrap();
            state.release(big);

            let ptr = state.allocate_aligned(PAGE_SIZE, None).unwrap();
            assert!(ptr.is_multiple_of(PAGE_SIZE));
            assert!(ptr < guard);
            let blocks = chain(state);
            assert_eq!(blocks[0], (PAGE_SIZE, PAGE_SIZE - 2 * D, false));
            assert_eq!(blocks[1], (2 * PAGE_SIZE - D, PAGE_SIZE, false));
            assert!(blocks[2].2);
        });
    }

    #[test]
    fn test_provenance_only_on_aligned_block() {
        with_test_state(4, |state| {
            let ptr = state
                .allocate_aligned(64, Some(Provenance::new("aligned.rs", 7)))
                .unwrap();
            assert_eq!(state.load(PAGE_SIZE).provenance(), None);
            let location = state.load(ptr - D).provenance().unwrap();
            assert_eq!(location.file.as_str(), "aligned.rs");
            assert_eq!(location.line, 7);
        });
    }

    #[test]
    fn test_aligned_out_of_memory() {
        with_test_state(2, |state| {
            let before = chain(state);
            assert_eq!(state.allocate_aligned(PAGE_SIZE, None), None);
            assert_eq!(state.allocate_aligned(0, None), None);
            assert_eq!(chain(state), before);
        });
    }
}
