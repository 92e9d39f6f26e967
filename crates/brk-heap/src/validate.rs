//! Heap validation and introspection.
//!
//! Everything here only reads the chain. Links are bounds checked before
//! they are followed, so a corrupted heap is reported instead of crashing
//! the walk.

use derive_more::IsVariant;
use snafu::{OptionExt as _, Snafu, ensure};

use crate::{
    chain::Block,
    descriptor::DESCRIPTOR_SIZE,
    heap::HeapState,
};

/// Ways the heap bookkeeping can be inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant, derive_more::Display)]
pub enum StateFault {
    #[display("heap has not been set up")]
    Uninitialized,
    #[display("first descriptor has a predecessor")]
    HeadHasPrev,
    #[display("descriptor at {at:#x} does not link to the block right after it")]
    BrokenLink { at: usize },
    #[display("link to {at:#x} points outside the heap")]
    DanglingLink { at: usize },
    #[display("last block ends at {tail_end:#x} but the break is {current_break:#x}")]
    TailBreakMismatch {
        tail_end: usize,
        current_break: usize,
    },
    #[display("backward traversal disagrees with forward traversal of {forward} blocks")]
    TraversalMismatch { forward: usize },
}

/// Result of a failed [`Heap::validate`](crate::Heap::validate).
///
/// Checks run in a fixed order and the first failure wins: heap state,
/// then guard pages, then each descriptor's guards and link in chain order.
#[derive(Debug, Snafu, IsVariant)]
pub enum ValidateError {
    #[snafu(display("invalid heap state: {fault}"))]
    InvalidState {
        fault: StateFault,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display(
        "guard pages overwritten: first intact={first_intact}, last intact={last_intact}"
    ))]
    InvalidGuardPages {
        first_intact: bool,
        last_intact: bool,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("descriptor guard overwritten at {at:#x}"))]
    InvalidDescriptorGuard {
        at: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Classification of an address relative to the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IsVariant, derive_more::Display)]
pub enum PointerKind {
    /// The null pointer.
    #[display("null")]
    Null,
    /// Outside the blocks of the heap.
    #[display("out of heap")]
    OutOfHeap,
    /// Inside a block descriptor.
    #[display("inside descriptor")]
    InsideDescriptor,
    /// Inside an allocated payload, past its first byte.
    #[display("inside payload")]
    InsidePayload,
    /// Inside the payload of a free block.
    #[display("inside free block")]
    InsideFree,
    /// The first byte of an allocated payload.
    #[display("payload start")]
    PayloadStart,
}

/// Usage statistics of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Allocated payload bytes plus the descriptors of every block.
    pub bytes_in_use: usize,
    /// Largest allocated payload.
    pub largest_used: usize,
    /// Number of allocated blocks, alignment padding included.
    pub used_count: usize,
    /// Free payload bytes.
    pub bytes_free: usize,
    /// Largest free payload.
    pub largest_free: usize,
    /// Number of free blocks able to hold at least one pointer.
    pub free_gap_count: usize,
}

impl HeapStats {
    /// Total bytes tiled by the chain.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.bytes_in_use + self.bytes_free
    }
}

impl HeapState {
    pub(crate) fn validate(&self) -> Result<(), ValidateError> {
        let head = self.root.context(InvalidStateSnafu {
            fault: StateFault::Uninitialized,
        })?;

        let guards = self.space.guard_pages();
        ensure!(
            guards.is_intact(),
            InvalidGuardPagesSnafu {
                first_intact: guards.first_intact,
                last_intact: guards.last_intact,
            }
        );

        let head_desc = self.try_load(head).context(InvalidStateSnafu {
            fault: StateFault::DanglingLink { at: head },
        })?;
        ensure!(
            head_desc.prev().is_none(),
            InvalidStateSnafu {
                fault: StateFault::HeadHasPrev,
            }
        );

        let current_break = self.space.current_break();
        let mut forward = 0;
        let mut at = head;
        let tail = loop {
            let desc = self.try_load(at).context(InvalidStateSnafu {
                fault: StateFault::DanglingLink { at },
            })?;
            ensure!(desc.guards_intact(), InvalidDescriptorGuardSnafu { at });
            forward += 1;

            let end = (at + DESCRIPTOR_SIZE).checked_add(desc.payload_size());
            let Some(next) = desc.next() else {
                ensure!(
                    end == Some(current_break),
                    InvalidStateSnafu {
                        fault: StateFault::TailBreakMismatch {
                            tail_end: end.unwrap_or(usize::MAX),
                            current_break,
                        },
                    }
                );
                break at;
            };
            ensure!(
                end == Some(next),
                InvalidStateSnafu {
                    fault: StateFault::BrokenLink { at },
                }
            );
            at = next;
        };

        let mismatch = InvalidStateSnafu {
            fault: StateFault::TraversalMismatch { forward },
        };
        let mut backward = 1;
        let mut at = tail;
        while let Some(prev) = self.load(at).prev() {
            ensure!(backward < forward && self.holds_descriptor(prev), mismatch);
            backward += 1;
            at = prev;
        }
        ensure!(backward == forward && at == head, mismatch);

        Ok(())
    }

    /// Finds the block whose descriptor or payload contains `addr`.
    fn enclosing(&self, addr: usize) -> Option<Block> {
        let head = self.root?;
        if addr < head || addr >= self.space.current_break() {
            return None;
        }
        self.blocks().find(|block| addr < block.end())
    }

    pub(crate) fn classify(&self, addr: Option<usize>) -> PointerKind {
        let Some(addr) = addr else {
            return PointerKind::Null;
        };
        let Some(block) = self.enclosing(addr) else {
            return PointerKind::OutOfHeap;
        };
        if addr < block.payload() {
            PointerKind::InsideDescriptor
        } else if block.desc.is_free() {
            PointerKind::InsideFree
        } else if addr == block.payload() {
            PointerKind::PayloadStart
        } else {
            PointerKind::InsidePayload
        }
    }

    pub(crate) fn payload_start_of(&self, addr: usize) -> Option<usize> {
        let block = self.enclosing(addr)?;
        (addr >= block.payload() && !block.desc.is_free()).then_some(block.payload())
    }

    pub(crate) fn payload_size_of(&self, addr: usize) -> usize {
        match self.enclosing(addr) {
            Some(block) if addr == block.payload() && !block.desc.is_free() => {
                block.desc.payload_size()
            }
            _ => 0,
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        for block in self.blocks() {
            let size = block.desc.payload_size();
            stats.bytes_in_use += DESCRIPTOR_SIZE;
            if block.desc.is_free() {
                stats.bytes_free += size;
                stats.largest_free = stats.largest_free.max(size);
                if size >= size_of::<usize>() {
                    stats.free_gap_count += 1;
                }
            } else {
                stats.bytes_in_use += size;
                stats.largest_used = stats.largest_used.max(size);
                stats.used_count += 1;
            }
        }
        stats
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HeapConfig, space::PAGE_SIZE};

    const D: usize = DESCRIPTOR_SIZE;

    fn test_state(pages: usize) -> HeapState {
        let mut state = HeapState::new(&HeapConfig::new().with_pages(pages).with_guard_seed(11));
        state.setup().unwrap();
        state
    }

    fn fault(err: &ValidateError) -> StateFault {
        match err {
            ValidateError::InvalidState { fault, .. } => *fault,
            _ => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn test_fresh_heap_is_valid() {
        let state = test_state(4);
        state.validate().unwrap();
        assert_eq!(
            state.stats(),
            HeapStats {
                bytes_in_use: D,
                largest_used: 0,
                used_count: 0,
                bytes_free: PAGE_SIZE - D,
                largest_free: PAGE_SIZE - D,
                free_gap_count: 1,
            }
        );
    }

    #[test]
    fn test_uninitialized_heap() {
        let state = HeapState::new(&HeapConfig::new().with_pages(4).with_guard_seed(11));
        let err = state.validate().unwrap_err();
        assert_eq!(fault(&err), StateFault::Uninitialized);
        assert_eq!(state.classify(Some(PAGE_SIZE + D)), PointerKind::OutOfHeap);
        assert_eq!(state.stats(), HeapStats::default());
    }

    #[test]
    fn test_descriptor_guard_corruption() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        // Overrun the payload by one byte into the next start guard.
        state.space.bytes_mut(a, 101).unwrap().fill(0);
        let err = state.validate().unwrap_err();
        assert!(err.is_invalid_descriptor_guard());
        assert!(matches!(
            err,
            ValidateError::InvalidDescriptorGuard { at, .. } if at == a + 100
        ));
    }

    #[test]
    fn test_end_guard_corruption() {
        let mut state = test_state(4);
        state.space.bytes_mut(PAGE_SIZE + D - 1, 1).unwrap()[0] = 0;
        assert!(state.validate().unwrap_err().is_invalid_descriptor_guard());
    }

    #[test]
    fn test_broken_next_link() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        state.modify(a - D, |desc| desc.set_next(Some(a + 200)));
        let err = state.validate().unwrap_err();
        assert_eq!(fault(&err), StateFault::BrokenLink { at: a - D });
    }

    #[test]
    fn test_dangling_next_link() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        state.modify(a - D, |desc| desc.set_payload_size(10 * PAGE_SIZE));
        state.modify(a - D, |desc| desc.set_next(Some(a + 10 * PAGE_SIZE)));
        let err = state.validate().unwrap_err();
        assert_eq!(fault(&err), StateFault::DanglingLink { at: a + 10 * PAGE_SIZE });
    }

    #[test]
    fn test_head_with_prev() {
        let mut state = test_state(4);
        state.modify(PAGE_SIZE, |desc| desc.set_prev(Some(PAGE_SIZE)));
        assert_eq!(fault(&state.validate().unwrap_err()), StateFault::HeadHasPrev);
    }

    #[test]
    fn test_tail_size_mismatch() {
        let mut state = test_state(4);
        state.modify(PAGE_SIZE, |desc| desc.set_payload_size(100));
        assert_eq!(
            fault(&state.validate().unwrap_err()),
            StateFault::TailBreakMismatch {
                tail_end: PAGE_SIZE + D + 100,
                current_break: 2 * PAGE_SIZE,
            }
        );
    }

    #[test]
    fn test_backward_link_mismatch() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        let b = state.allocate(100, None).unwrap();
        state.modify(b - D, |desc| desc.set_prev(None));
        assert_eq!(
            fault(&state.validate().unwrap_err()),
            StateFault::TraversalMismatch { forward: 3 }
        );

        state.modify(b - D, |desc| desc.set_prev(Some(b - D)));
        assert!(state.validate().unwrap_err().is_invalid_state());
        state.modify(b - D, |desc| desc.set_prev(Some(a - D)));
        state.validate().unwrap();
    }

    #[test]
    fn test_guard_pages_take_priority() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        state.space.bytes_mut(a - D, 1).unwrap()[0] = 0;
        let boundary = state.space.info().mmap_boundary;
        let byte = state.space.bytes(boundary, 1).unwrap()[0];
        state.space.bytes_mut(boundary, 1).unwrap()[0] = !byte;

        let err = state.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidateError::InvalidGuardPages {
                first_intact: true,
                last_intact: false,
                ..
            }
        ));
    }

    #[test]
    fn test_classify() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        let b = state.allocate(100, None).unwrap();
        state.release(a);

        assert_eq!(state.classify(None), PointerKind::Null);
        assert_eq!(state.classify(Some(8)), PointerKind::OutOfHeap);
        assert_eq!(state.classify(Some(2 * PAGE_SIZE)), PointerKind::OutOfHeap);
        assert_eq!(state.classify(Some(b - D)), PointerKind::InsideDescriptor);
        assert_eq!(state.classify(Some(b - 1)), PointerKind::InsideDescriptor);
        assert_eq!(state.classify(Some(b)), PointerKind::PayloadStart);
        assert_eq!(state.classify(Some(b + 99)), PointerKind::InsidePayload);
        assert_eq!(state.classify(Some(a)), PointerKind::InsideFree);
        assert_eq!(state.classify(Some(b + 100)), PointerKind::InsideDescriptor);
    }

    #[test]
    fn test_payload_lookup() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();

        assert_eq!(state.payload_start_of(a), Some(a));
        assert_eq!(state.payload_start_of(a + 50), Some(a));
        assert_eq!(state.payload_start_of(a - 1), None);
        assert_eq!(state.payload_start_of(a + 200), None);
        assert_eq!(state.payload_start_of(0), None);

        assert_eq!(state.payload_size_of(a), 100);
        assert_eq!(state.payload_size_of(a + 1), 0);
        assert_eq!(state.payload_size_of(a + 200), 0);
    }

    #[test]
    fn test_stats() {
        let mut state = test_state(4);
        let a = state.allocate(100, None).unwrap();
        state.allocate(300, None).unwrap();
        state.allocate(4, None).unwrap();
        state.release(a);
        state.allocate(PAGE_SIZE - 4 * D - 404, None).unwrap();

        let stats = state.stats();
        assert_eq!(stats.used_count, 3);
        assert_eq!(stats.largest_used, PAGE_SIZE - 4 * D - 404);
        assert_eq!(stats.bytes_free, 100);
        assert_eq!(stats.largest_free, 100);
        assert_eq!(stats.free_gap_count, 1);
        assert_eq!(stats.total(), PAGE_SIZE);
    }
}
