//! The doubly linked descriptor chain.
//!
//! Descriptors tile the heap from `start_break` to `current_break` with no
//! gaps: the successor of a descriptor at `at` always sits at
//! `at + DESCRIPTOR_SIZE + payload_size`, and the last descriptor ends
//! exactly at the break. The helpers here keep that invariant while blocks
//! are split and merged; the allocation engines build on them.

use crate::{
    descriptor::{DESCRIPTOR_SIZE, RawDescriptor},
    heap::HeapState,
};

/// A descriptor together with its position.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block {
    pub(crate) at: usize,
    pub(crate) desc: RawDescriptor,
}

impl Block {
    pub(crate) const fn payload(&self) -> usize {
        self.at + DESCRIPTOR_SIZE
    }

    /// One past the last payload byte, saturating on a corrupted size.
    pub(crate) const fn end(&self) -> usize {
        self.payload().saturating_add(self.desc.payload_size())
    }
}

/// Forward iterator over the chain.
///
/// Iteration stops at the first link that does not move forward or points
/// outside the arena, so it always terminates even on a corrupted chain.
pub(crate) struct Blocks<'a> {
    state: &'a HeapState,
    next: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.next.take()?;
        let desc = self.state.try_load(at)?;
        self.next = desc.next().filter(|&next| next > at);
        Some(Block { at, desc })
    }
}

impl HeapState {
    /// Reads the descriptor stored at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor does not fit in the arena.
    pub(crate) fn load(&self, at: usize) -> RawDescriptor {
        self.space.view().read(at)
    }

    /// Reads the descriptor stored at `at` if it lies inside the break.
    pub(crate) fn try_load(&self, at: usize) -> Option<RawDescriptor> {
        self.holds_descriptor(at)
            .then(|| self.space.view().try_read(at))
            .flatten()
    }

    pub(crate) fn store(&mut self, at: usize, desc: &RawDescriptor) {
        self.space.view_mut().write(at, desc);
    }

    pub(crate) fn modify<F, R>(&mut self, at: usize, f: F) -> R
    where
        F: FnOnce(&mut RawDescriptor) -> R,
    {
        let mut desc = self.load(at);
        let res = f(&mut desc);
        self.store(at, &desc);
        res
    }

    /// Returns `true` if a whole descriptor at `at` lies inside the break.
    pub(crate) fn holds_descriptor(&self, at: usize) -> bool {
        at >= self.space.start_break()
            && at
                .checked_add(DESCRIPTOR_SIZE)
                .is_some_and(|end| end <= self.space.current_break())
    }

    /// Maps a payload address to the descriptor in front of it.
    ///
    /// Only checks that such a descriptor would lie inside the break, not
    /// that it is part of the chain.
    pub(crate) fn descriptor_of(&self, payload: usize) -> Option<usize> {
        self.root?;
        payload
            .checked_sub(DESCRIPTOR_SIZE)
            .filter(|&at| self.holds_descriptor(at))
    }

    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            state: self,
            next: self.root,
        }
    }

    pub(crate) fn tail(&self) -> Option<Block> {
        self.blocks().last()
    }

    /// Shrinks the block at `at` to `size` bytes and turns the rest of its
    /// payload into a new free block right after it.
    ///
    /// The caller guarantees the payload holds at least
    /// `size + DESCRIPTOR_SIZE` bytes. Returns the address of the new block.
    pub(crate) fn split(&mut self, at: usize, size: usize) -> usize {
        let mut desc = self.load(at);
        debug_assert!(desc.payload_size() >= size + DESCRIPTOR_SIZE);

        let rest_at = at + DESCRIPTOR_SIZE + size;
        let rest = RawDescriptor::free(
            desc.payload_size() - size - DESCRIPTOR_SIZE,
            Some(at),
            desc.next(),
        );
        if let Some(next) = desc.next() {
            self.modify(next, |next| next.set_prev(Some(rest_at)));
        }
        desc.set_payload_size(size);
        desc.set_next(Some(rest_at));
        self.store(at, &desc);
        self.store(rest_at, &rest);
        rest_at
    }

    /// Merges every run of adjacent free blocks into its first block.
    ///
    /// The absorbed descriptors are left in place, guards and all, inside
    /// the payload of the surviving block.
    pub(crate) fn coalesce(&mut self) {
        let Some(head) = self.root else {
            return;
        };
        let mut prev_at = head;
        let mut cursor = self.load(head).next();
        while let Some(at) = cursor {
            let desc = self.load(at);
            let prev = self.load(prev_at);
            cursor = desc.next();

            if !(prev.is_free() && desc.is_free()) {
                prev_at = at;
                continue;
            }

            if let Some(next) = desc.next() {
                self.modify(next, |next| next.set_prev(Some(prev_at)));
            }
            self.modify(prev_at, |prev| {
                prev.set_next(desc.next());
                prev.set_payload_size(prev.payload_size() + desc.payload_size() + DESCRIPTOR_SIZE);
            });
        }
    }
}
