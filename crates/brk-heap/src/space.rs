//! Simulated process address space.
//!
//! The arena is one fixed-size byte buffer laid out like the data segment of
//! a process, fenced by a guard page on each side:
//!
//! ```text
//!  0          PAGE_SIZE                                 mmap_boundary
//!  ┌──────────┬──────────────────────┬──────────────────┬──────────┐
//!  │  guard   │  heap (in use)       │  unused          │  guard   │
//!  └──────────┴──────────────────────┴──────────────────┴──────────┘
//!             ▲                      ▲
//!        start_break            current_break
//! ```
//!
//! The break moves with [`AddressSpace::sbrk`]. The guard pages are filled
//! with random bytes once, when the arena is created, and a copy is kept
//! outside the arena. Allocator logic never writes to them, so any
//! difference between the arena and the copy proves that something wrote
//! out of bounds.

use dataview::DataView;
use rand::Rng as _;
use snafu::{OptionExt as _, Snafu, ensure};

use crate::config::HeapConfig;

/// Size of a page of the simulated address space.
pub const PAGE_SIZE: usize = 4096;

/// Number of guard pages on each side of the usable area.
const FENCE_PAGES: usize = 1;

/// Errors returned when the break cannot move.
#[derive(Debug, Snafu)]
pub enum SbrkError {
    #[snafu(display(
        "cannot move break {current_break:#x} by {delta} bytes: mmap boundary is {mmap_boundary:#x}"
    ))]
    OutOfMemory {
        delta: isize,
        current_break: usize,
        mmap_boundary: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Errors returned by raw accesses to the simulated address space.
#[derive(Debug, Snafu)]
pub enum AccessError {
    #[snafu(display("access of {len} bytes at {addr:#x} exceeds the arena size {arena_size:#x}"))]
    OutOfBounds {
        addr: usize,
        len: usize,
        arena_size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Integrity of the two guard pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPageStatus {
    /// The guard page below the heap still holds its original bytes.
    pub first_intact: bool,
    /// The guard page above the usable area still holds its original bytes.
    pub last_intact: bool,
}

impl GuardPageStatus {
    /// Returns `true` if both guard pages are unchanged.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        self.first_intact && self.last_intact
    }
}

/// Break positions of a simulated address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Address of the first usable byte.
    pub start_break: usize,
    /// Current end of the heap.
    pub current_break: usize,
    /// Address of the last guard page; the break always stays below it.
    pub mmap_boundary: usize,
}

impl SpaceInfo {
    /// Total number of usable bytes between the guard pages.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mmap_boundary - self.start_break
    }

    /// Number of bytes currently reserved by the break.
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.current_break - self.start_break
    }
}

struct GuardPages {
    first: Box<[u8]>,
    last: Box<[u8]>,
}

pub(crate) struct AddressSpace {
    memory: Box<[u8]>,
    fence: GuardPages,
    start_break: usize,
    current_break: usize,
    mmap_boundary: usize,
}

impl AddressSpace {
    pub(crate) fn new(config: &HeapConfig) -> Self {
        let mmap_boundary = (FENCE_PAGES + config.pages()) * PAGE_SIZE;
        let arena_size = mmap_boundary + FENCE_PAGES * PAGE_SIZE;

        let mut rng = config.guard_rng();
        let mut fence = GuardPages {
            first: vec![0; FENCE_PAGES * PAGE_SIZE].into_boxed_slice(),
            last: vec![0; FENCE_PAGES * PAGE_SIZE].into_boxed_slice(),
        };
        rng.fill(&mut fence.first[..]);
        rng.fill(&mut fence.last[..]);

        let mut memory = vec![0; arena_size].into_boxed_slice();
        memory[..fence.first.len()].copy_from_slice(&fence.first);
        memory[mmap_boundary..].copy_from_slice(&fence.last);

        let start_break = FENCE_PAGES * PAGE_SIZE;
        Self {
            memory,
            fence,
            start_break,
            current_break: start_break,
            mmap_boundary,
        }
    }

    /// Moves the break by `delta` bytes and returns the previous break.
    ///
    /// A shrink below `start_break` is clamped to a no-op. The break may
    /// never reach `mmap_boundary`. The moved range is neither zeroed nor
    /// checked.
    pub(crate) fn sbrk(&mut self, delta: isize) -> Result<usize, SbrkError> {
        let old_break = self.current_break;
        let new_break = match old_break.checked_add_signed(delta) {
            Some(new_break) if new_break >= self.start_break => new_break,
            Some(_) => return Ok(old_break),
            None if delta < 0 => return Ok(old_break),
            None => usize::MAX,
        };
        ensure!(
            new_break < self.mmap_boundary,
            OutOfMemorySnafu {
                delta,
                current_break: old_break,
                mmap_boundary: self.mmap_boundary,
            }
        );
        self.current_break = new_break;
        Ok(old_break)
    }

    /// Grows the break by `bytes` and returns the previous break.
    pub(crate) fn grow(&mut self, bytes: usize) -> Result<usize, SbrkError> {
        let delta = isize::try_from(bytes).ok().context(OutOfMemorySnafu {
            delta: isize::MAX,
            current_break: self.current_break,
            mmap_boundary: self.mmap_boundary,
        })?;
        self.sbrk(delta)
    }

    /// Shrinks the break by `bytes`, clamped at `start_break`.
    pub(crate) fn shrink(&mut self, bytes: usize) {
        let delta = isize::try_from(bytes).map_or(isize::MIN, |bytes| -bytes);
        // A shrink only fails by clamping, which `sbrk` already does.
        let _ = self.sbrk(delta);
    }

    pub(crate) fn start_break(&self) -> usize {
        self.start_break
    }

    pub(crate) fn current_break(&self) -> usize {
        self.current_break
    }

    pub(crate) fn info(&self) -> SpaceInfo {
        SpaceInfo {
            start_break: self.start_break,
            current_break: self.current_break,
            mmap_boundary: self.mmap_boundary,
        }
    }

    pub(crate) fn guard_pages(&self) -> GuardPageStatus {
        let first = &self.memory[..self.fence.first.len()];
        let last = &self.memory[self.mmap_boundary..][..self.fence.last.len()];
        GuardPageStatus {
            first_intact: *first == *self.fence.first,
            last_intact: *last == *self.fence.last,
        }
    }

    pub(crate) fn view(&self) -> &DataView {
        DataView::from(&self.memory[..])
    }

    pub(crate) fn view_mut(&mut self) -> &mut DataView {
        DataView::from_mut(&mut self.memory[..])
    }

    pub(crate) fn bytes(&self, addr: usize, len: usize) -> Result<&[u8], AccessError> {
        let arena_size = self.memory.len();
        addr.checked_add(len)
            .filter(|&end| end <= arena_size)
            .map(|end| &self.memory[addr..end])
            .context(OutOfBoundsSnafu {
                addr,
                len,
                arena_size,
            })
    }

    pub(crate) fn bytes_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], AccessError> {
        let arena_size = self.memory.len();
        match addr.checked_add(len) {
            Some(end) if end <= arena_size => Ok(&mut self.memory[addr..end]),
            _ => OutOfBoundsSnafu {
                addr,
                len,
                arena_size,
            }
            .fail(),
        }
    }

    /// Copies `len` bytes from `src` to `dst` inside the arena.
    ///
    /// # Panics
    ///
    /// Panics if either range leaves the arena.
    pub(crate) fn copy(&mut self, src: usize, dst: usize, len: usize) {
        self.memory.copy_within(src..src + len, dst);
    }
}
