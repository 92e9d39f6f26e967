//! A first-fit heap allocator over a simulated process address space.
//!
//! A [`Heap`] owns a fixed-size byte arena laid out like the data segment of
//! a process: a guard page, the area the break pointer moves through, and a
//! second guard page. The heap itself is a doubly linked chain of block
//! descriptors stored in-band, each one right in front of the payload it
//! describes, tiling the arena from its start to the current break.
//!
//! # Operations
//!
//! - [`Heap::allocate`], [`Heap::fill`], [`Heap::resize`] and
//!   [`Heap::release`] manage payloads with a first-fit search, splitting
//!   oversized blocks and moving the break by whole pages when nothing fits.
//! - The `*_aligned` variants return page-aligned payloads.
//! - The `*_debug` variants record a [`Provenance`] in the descriptor.
//! - [`Heap::validate`], [`Heap::classify_pointer`], [`Heap::stats`] and
//!   [`Heap::diagnostics`] inspect the heap without changing it.
//!
//! # Usage Example
//!
//! ```rust
//! use brk_heap::{Heap, HeapConfig, PAGE_SIZE};
//!
//! let heap = Heap::new(HeapConfig::new().with_pages(64));
//! heap.setup().unwrap();
//!
//! let table = heap.fill(16, 8).unwrap();
//! assert_eq!(heap.to_vec(table, 128).unwrap(), [0; 128]);
//!
//! let page = heap.allocate_aligned(100).unwrap();
//! assert!(page.is_aligned_to(PAGE_SIZE));
//!
//! heap.release(table);
//! heap.release(page);
//! heap.validate().unwrap();
//! ```
//!
//! # Corruption
//!
//! Mutating operations trust the chain as they find it. Out-of-bounds
//! writes are detected afterwards by [`Heap::validate`], which checks the
//! guard pages, the guard bytes of every descriptor and the geometry of the
//! links. A heap that fails validation can not be reset with
//! [`Heap::setup`].
//!
//! # Thread Safety
//!
//! [`Heap`] is `Sync`. Every operation takes a single spin lock for its
//! whole duration.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod aligned;
mod chain;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
mod engine;
pub mod global;
pub mod heap;
pub mod ptr;
pub mod space;
pub mod validate;

pub use self::{
    config::HeapConfig,
    descriptor::{DESCRIPTOR_SIZE, NEXT_LINK_OFFSET, Provenance, SourceLocation},
    diagnostics::{BlockInfo, Diagnostics},
    global::global,
    heap::{Heap, SetupError},
    ptr::HeapPtr,
    space::{AccessError, GuardPageStatus, PAGE_SIZE, SbrkError, SpaceInfo},
    validate::{HeapStats, PointerKind, StateFault, ValidateError},
};
