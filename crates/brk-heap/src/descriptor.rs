//! In-band block descriptors.
//!
//! Every block of the heap starts with a [`RawDescriptor`], immediately
//! followed by the payload it describes:
//!
//! ```text
//! ┌──────────────────────────────────────────────┬──────────────────────┐
//! │ RawDescriptor (64 bytes on 64-bit targets)   │ payload              │
//! │ ┌──┬──┬──┬──┬────┬────┬────┬────┬───────┬──┐ │ (payload_size bytes) │
//! │ │55│fr│tr│  │line│prev│next│size│ file  │AA│ │                      │
//! │ └──┴──┴──┴──┴────┴────┴────┴────┴───────┴──┘ │                      │
//! └──────────────────────────────────────────────┴──────────────────────┘
//!                                                ▲
//!                                                └── pointer handed out
//! ```
//!
//! The record is plain old data with no padding, so every byte of it is
//! meaningful and a corrupted byte in the guards or links is detectable by
//! the validator. Links are arena addresses, `0` standing for null.

use core::{mem::offset_of, str};

use arrayvec::ArrayString;
use dataview::Pod;

/// Sentinel stored in the first byte of every descriptor.
pub(crate) const START_GUARD: u8 = 0x55;
/// Sentinel stored in the last byte of every descriptor.
pub(crate) const END_GUARD: u8 = 0xAA;

/// Maximum number of bytes of a source file name kept in a descriptor.
pub const SOURCE_FILE_CAPACITY: usize = 30;

/// Size of the in-band descriptor preceding every payload.
pub const DESCRIPTOR_SIZE: usize = size_of::<RawDescriptor>();

/// Byte offset of the `next` link inside a descriptor.
///
/// Only useful to tools that corrupt a heap on purpose.
pub const NEXT_LINK_OFFSET: usize = offset_of!(RawDescriptor, next);

const NULL_LINK: usize = 0;

/// Source location attached to an allocation.
///
/// # Examples
///
/// ```
/// use brk_heap::{Heap, HeapConfig, Provenance};
///
/// let heap = Heap::new(HeapConfig::new().with_pages(4));
/// heap.setup().unwrap();
/// let ptr = heap.allocate_debug(32, Provenance::caller()).unwrap();
/// let info = heap.diagnostics().blocks[0].clone();
/// assert_eq!(info.payload, ptr);
/// assert!(info.provenance.is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance<'a> {
    file: &'a str,
    line: u32,
}

impl<'a> Provenance<'a> {
    #[must_use]
    pub const fn new(file: &'a str, line: u32) -> Self {
        Self { file, line }
    }

    #[must_use]
    pub const fn file(&self) -> &'a str {
        self.file
    }

    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl Provenance<'static> {
    /// Captures the location of the caller.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let location = core::panic::Location::caller();
        Self::new(location.file(), location.line())
    }
}

/// Source location read back from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// File name, truncated to [`SOURCE_FILE_CAPACITY`] bytes.
    pub file: ArrayString<SOURCE_FILE_CAPACITY>,
    pub line: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub(crate) struct RawDescriptor {
    start_guard: u8,
    free: u8,
    tracked: u8,
    reserved: u8,
    source_line: u32,
    prev: usize,
    next: usize,
    payload_size: usize,
    source_file: [u8; SOURCE_FILE_CAPACITY + 1],
    end_guard: u8,
}

const _: () = assert!(DESCRIPTOR_SIZE.is_multiple_of(align_of::<RawDescriptor>()));

impl RawDescriptor {
    /// Creates a free descriptor with intact guards and no provenance.
    pub(crate) const fn free(payload_size: usize, prev: Option<usize>, next: Option<usize>) -> Self {
        Self {
            start_guard: START_GUARD,
            free: 1,
            tracked: 0,
            reserved: 0,
            source_line: 0,
            prev: encode_link(prev),
            next: encode_link(next),
            payload_size,
            source_file: [0; SOURCE_FILE_CAPACITY + 1],
            end_guard: END_GUARD,
        }
    }

    pub(crate) const fn is_free(&self) -> bool {
        self.free != 0
    }

    pub(crate) const fn set_free(&mut self, free: bool) {
        self.free = free as u8;
    }

    pub(crate) const fn guards_intact(&self) -> bool {
        self.start_guard == START_GUARD && self.end_guard == END_GUARD
    }

    pub(crate) const fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) const fn set_payload_size(&mut self, payload_size: usize) {
        self.payload_size = payload_size;
    }

    pub(crate) const fn prev(&self) -> Option<usize> {
        decode_link(self.prev)
    }

    pub(crate) const fn set_prev(&mut self, prev: Option<usize>) {
        self.prev = encode_link(prev);
    }

    pub(crate) const fn next(&self) -> Option<usize> {
        decode_link(self.next)
    }

    pub(crate) const fn set_next(&mut self, next: Option<usize>) {
        self.next = encode_link(next);
    }

    /// Records where the block was allocated, or forgets it.
    ///
    /// File names longer than [`SOURCE_FILE_CAPACITY`] bytes are cut at the
    /// last character boundary that fits.
    pub(crate) fn set_provenance(&mut self, provenance: Option<Provenance<'_>>) {
        self.source_file = [0; SOURCE_FILE_CAPACITY + 1];
        let Some(provenance) = provenance else {
            self.tracked = 0;
            self.source_line = 0;
            return;
        };

        let file = provenance.file;
        let mut len = file.len().min(SOURCE_FILE_CAPACITY);
        while !file.is_char_boundary(len) {
            len -= 1;
        }
        self.source_file[..len].copy_from_slice(&file.as_bytes()[..len]);
        self.source_line = provenance.line;
        self.tracked = 1;
    }

    pub(crate) fn provenance(&self) -> Option<SourceLocation> {
        if self.tracked == 0 {
            return None;
        }
        let bytes = &self.source_file[..SOURCE_FILE_CAPACITY];
        let bytes = bytes
            .iter()
            .position(|&b| b == 0)
            .map_or(bytes, |end| &bytes[..end]);
        let file = match str::from_utf8(bytes) {
            Ok(file) => file,
            Err(err) => str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
        };
        Some(SourceLocation {
            file: ArrayString::from(file).unwrap_or_default(),
            line: self.source_line,
        })
    }
}

const fn encode_link(link: Option<usize>) -> usize {
    match link {
        Some(at) => at,
        None => NULL_LINK,
    }
}

const fn decode_link(link: usize) -> Option<usize> {
    if link == NULL_LINK { None } else { Some(link) }
}
