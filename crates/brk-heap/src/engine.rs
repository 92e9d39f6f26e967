//! First-fit allocation engine.
//!
//! # Algorithm
//!
//! - **Search**: the chain is scanned from the head for the first free block
//!   whose capacity either equals the request or exceeds it by more than one
//!   descriptor. Capacities in between are skipped: splitting them would
//!   leave no room for the remainder's descriptor, and handing them out
//!   whole would break the "payload size equals request" contract.
//! - **Split**: an oversized block keeps the request; the remainder becomes
//!   a new free block right behind it.
//! - **Growth**: when nothing fits, the break grows by whole pages from the
//!   tail and the extended tail is split.
//! - **Release**: the block is marked free, every run of adjacent free
//!   blocks is merged, and whole trailing free pages go back to the break.

use crate::{
    descriptor::{DESCRIPTOR_SIZE, Provenance, RawDescriptor},
    heap::HeapState,
    space::PAGE_SIZE,
};

/// Where a new payload may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// First fit, payload right after its descriptor.
    Packed,
    /// First fit, payload on a page boundary.
    PageAligned,
}

/// The block the break grows from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Trailing {
    /// Position of the block that will hold the grown capacity.
    pub(crate) at: usize,
    tail: usize,
    capacity: usize,
    /// The tail is in use, so a new block is appended at the break.
    fresh: bool,
}

const fn fits(capacity: usize, size: usize) -> bool {
    match capacity.checked_sub(size) {
        Some(excess) => excess == 0 || excess > DESCRIPTOR_SIZE,
        None => false,
    }
}

impl HeapState {
    pub(crate) fn place(
        &mut self,
        placement: Placement,
        size: usize,
        provenance: Option<Provenance<'_>>,
    ) -> Option<usize> {
        match placement {
            Placement::Packed => self.allocate(size, provenance),
            Placement::PageAligned => self.allocate_aligned(size, provenance),
        }
    }

    /// Allocates `size` bytes and returns the payload address.
    pub(crate) fn allocate(
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
            if desc.is_free() && fits(desc.payload_size(), size) {
                if desc.payload_size() > size {
                    self.split(at, size);
                }
                self.claim(at, provenance);
                return Some(at + DESCRIPTOR_SIZE);
            }
            last = at;
            cursor = desc.next();
        }

        let extent = size.checked_add(DESCRIPTOR_SIZE)?;
        let trailing = self.trailing(last);
        let block = self.grow(trailing, extent)?;
        self.split(block, size);
        self.claim(block, provenance);
        Some(block + DESCRIPTOR_SIZE)
    }

    /// Marks the block at `at` allocated and stamps its provenance.
    pub(crate) fn claim(&mut self, at: usize, provenance: Option<Provenance<'_>>) {
        self.modify(at, |desc| {
            desc.set_free(false);
            desc.set_provenance(provenance);
        });
    }

    /// Describes the block that growth starting at the tail `tail` extends.
    pub(crate) fn trailing(&self, tail: usize) -> Trailing {
        let desc = self.load(tail);
        if desc.is_free() {
            Trailing {
                at: tail,
                tail,
                capacity: desc.payload_size(),
                fresh: false,
            }
        } else {
            Trailing {
                at: self.space.current_break(),
                tail,
                capacity: 0,
                fresh: true,
            }
        }
    }

    /// Grows the break by whole pages until the trailing block can hold
    /// `extent` payload bytes, and returns the trailing block.
    ///
    /// Nothing is modified if the break cannot grow.
    pub(crate) fn grow(&mut self, trailing: Trailing, extent: usize) -> Option<usize> {
        let shortfall = if trailing.fresh {
            extent.checked_add(DESCRIPTOR_SIZE)?
        } else {
            extent.saturating_sub(trailing.capacity)
        };
        let bytes = shortfall.checked_next_multiple_of(PAGE_SIZE)?;

        if let Err(err) = self.space.grow(bytes) {
            log::debug!("heap exhausted: {err}");
            return None;
        }
        log::debug!(
            "break grown by {bytes} bytes to {:#x}",
            self.space.current_break()
        );

        if trailing.fresh {
            let desc = RawDescriptor::free(bytes - DESCRIPTOR_SIZE, Some(trailing.tail), None);
            self.store(trailing.at, &desc);
            self.modify(trailing.tail, |tail| tail.set_next(Some(trailing.at)));
        } else {
            self.modify(trailing.at, |desc| {
                desc.set_payload_size(trailing.capacity + bytes);
            });
        }
        Some(trailing.at)
    }

    /// Frees the block whose payload starts at `payload`.
    ///
    /// The pointer is trusted: only pointers whose descriptor would lie
    /// outside the break are rejected.
    pub(crate) fn release(&mut self, payload: usize) {
        let Some(at) = self.descriptor_of(payload) else {
            log::warn!("ignoring release of {payload:#x}: not a heap address");
            return;
        };
        self.modify(at, |desc| desc.set_free(true));
        self.coalesce();
        self.trim();
    }

    /// Returns whole free pages at the end of the heap to the break.
    fn trim(&mut self) {
        let Some(tail) = self.tail() else {
            return;
        };
        let capacity = tail.desc.payload_size();
        if !tail.desc.is_free() || capacity <= PAGE_SIZE {
            return;
        }

        let bytes = capacity / PAGE_SIZE * PAGE_SIZE;
        self.space.shrink(bytes);
        self.modify(tail.at, |desc| desc.set_payload_size(capacity % PAGE_SIZE));
        log::debug!(
            "break shrunk by {bytes} bytes to {:#x}",
            self.space.current_break()
        );
    }

    /// Moves the payload at `payload` into a new block of `new_size` bytes.
    ///
    /// A missing pointer allocates, a zero size releases and hands the stale
    /// pointer back. On failure the old block stays allocated and untouched.
    pub(crate) fn resize(
        &mut self,
        payload: Option<usize>,
        new_size: usize,
        placement: Placement,
        provenance: Option<Provenance<'_>>,
    ) -> Option<usize> {
        let Some(old) = payload else {
            return self.place(placement, new_size, provenance);
        };
        if new_size == 0 {
            self.release(old);
            return Some(old);
        }

        let old_size = self.load(self.descriptor_of(old)?).payload_size();
        let new = self.place(placement, new_size, provenance)?;
        self.space.copy(old, new, old_size.min(new_size));
        self.release(old);
        Some(new)
    }

    /// Allocates `count * elem_size` zeroed bytes.
    ///
    /// The product wraps on overflow.
    pub(crate) fn fill(
        &mut self,
        count: usize,
        elem_size: usize,
        placement: Placement,
        provenance: Option<Provenance<'_>>,
    ) -> Option<usize> {
        let size = count.wrapping_mul(elem_size);
        let payload = self.place(placement, size, provenance)?;
        self.space.bytes_mut(payload, size).ok()?.fill(0);
        Some(payload)
    }
}
