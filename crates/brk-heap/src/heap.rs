//! The public heap instance.

use snafu::{ResultExt as _, Snafu};
use spin::Mutex;

use crate::{
    config::HeapConfig,
    descriptor::{DESCRIPTOR_SIZE, Provenance, RawDescriptor},
    diagnostics::Diagnostics,
    engine::Placement,
    ptr::HeapPtr,
    space::{AccessError, AddressSpace, GuardPageStatus, PAGE_SIZE, SbrkError, SpaceInfo},
    validate::{HeapStats, PointerKind, ValidateError},
};

/// Errors returned by [`Heap::setup`].
#[derive(Debug, Snafu)]
pub enum SetupError {
    #[snafu(display("refusing to reset a corrupted heap"))]
    Corrupted {
        #[snafu(source)]
        source: ValidateError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("cannot reserve the first heap page"))]
    OutOfMemory {
        #[snafu(source)]
        source: SbrkError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Everything guarded by the heap lock.
pub(crate) struct HeapState {
    pub(crate) space: AddressSpace,
    /// First descriptor of the chain, `None` until the heap is set up.
    pub(crate) root: Option<usize>,
}

impl HeapState {
    pub(crate) fn new(config: &HeapConfig) -> Self {
        Self {
            space: AddressSpace::new(config),
            root: None,
        }
    }

    /// Creates the first heap page, or resets an existing heap to it.
    ///
    /// An existing heap is validated first and left alone if it is
    /// corrupted.
    pub(crate) fn setup(&mut self) -> Result<(), SetupError> {
        let initial = RawDescriptor::free(PAGE_SIZE - DESCRIPTOR_SIZE, None, None);

        if let Some(head) = self.root {
            self.validate().context(CorruptedSnafu)?;
            let excess = self.space.current_break().saturating_sub(head + PAGE_SIZE);
            self.space.shrink(excess);
            self.store(head, &initial);
            log::info!("heap reset to a single page at {head:#x}");
            return Ok(());
        }

        let head = self.space.grow(PAGE_SIZE).context(OutOfMemorySnafu)?;
        self.store(head, &initial);
        self.root = Some(head);
        log::info!("heap created at {head:#x}");
        Ok(())
    }
}

/// A heap allocator over its own simulated address space.
///
/// All state lives behind one lock. Every operation, read-only ones
/// included, holds it from start to finish, so operations from different
/// threads never interleave.
///
/// Addresses handed out are [`HeapPtr`]s into the simulated space. Their
/// contents are accessed through [`Heap::read`] and [`Heap::write`].
///
/// # Examples
///
/// ```
/// use brk_heap::{Heap, HeapConfig, PointerKind};
///
/// let heap = Heap::new(HeapConfig::new().with_pages(64));
/// heap.setup().unwrap();
///
/// let ptr = heap.allocate(5000).unwrap();
/// assert_eq!(heap.payload_size_of(ptr), 5000);
/// heap.write(ptr, b"hello").unwrap();
///
/// let ptr = heap.resize(ptr, 500).unwrap();
/// assert_eq!(heap.to_vec(ptr, 5).unwrap(), b"hello");
///
/// heap.release(ptr);
/// assert_ne!(heap.classify_pointer(ptr), PointerKind::PayloadStart);
/// heap.validate().unwrap();
/// ```
pub struct Heap {
    state: Mutex<HeapState>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl Heap {
    /// Creates the address space described by `config`.
    ///
    /// The heap is empty until [`Heap::setup`] is called; allocations fail
    /// until then.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        Self {
            state: Mutex::new(HeapState::new(&config)),
        }
    }

    /// Creates the first heap page, or resets the heap to a single free
    /// page.
    ///
    /// A reset is refused when the heap fails validation; every pointer
    /// handed out before a successful reset is invalid afterwards.
    pub fn setup(&self) -> Result<(), SetupError> {
        self.state.lock().setup()
    }

    fn place(
        &self,
        placement: Placement,
        size: usize,
        provenance: Option<Provenance<'_>>,
    ) -> Option<HeapPtr> {
        let ptr = self
            .state
            .lock()
            .place(placement, size, provenance)
            .and_then(HeapPtr::new);
        log::trace!("allocate({size}, {placement:?}) -> {ptr:?}");
        ptr
    }

    fn fill_with(
        &self,
        count: usize,
        elem_size: usize,
        placement: Placement,
        provenance: Option<Provenance<'_>>,
    ) -> Option<HeapPtr> {
        let ptr = self
            .state
            .lock()
            .fill(count, elem_size, placement, provenance)
            .and_then(HeapPtr::new);
        log::trace!("fill({count}, {elem_size}, {placement:?}) -> {ptr:?}");
        ptr
    }

    fn resize_with(
        &self,
        ptr: Option<HeapPtr>,
        new_size: usize,
        placement: Placement,
        provenance: Option<Provenance<'_>>,
    ) -> Option<HeapPtr> {
        let new = self
            .state
            .lock()
            .resize(ptr.map(HeapPtr::addr), new_size, placement, provenance)
            .and_then(HeapPtr::new);
        log::trace!("resize({ptr:?}, {new_size}, {placement:?}) -> {new:?}");
        new
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `None` for a zero size or when the break cannot grow; the
    /// heap is unchanged in both cases.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<HeapPtr> {
        self.place(Placement::Packed, size, None)
    }

    /// Allocates `size` bytes whose first byte is page aligned.
    #[must_use]
    pub fn allocate_aligned(&self, size: usize) -> Option<HeapPtr> {
        self.place(Placement::PageAligned, size, None)
    }

    /// Allocates `size` bytes and records where the allocation came from.
    #[must_use]
    pub fn allocate_debug(&self, size: usize, provenance: Provenance<'_>) -> Option<HeapPtr> {
        self.place(Placement::Packed, size, Some(provenance))
    }

    #[must_use]
    pub fn allocate_aligned_debug(
        &self,
        size: usize,
        provenance: Provenance<'_>,
    ) -> Option<HeapPtr> {
        self.place(Placement::PageAligned, size, Some(provenance))
    }

    /// Allocates `count * elem_size` zeroed bytes.
    ///
    /// The product wraps on overflow instead of failing.
    #[must_use]
    pub fn fill(&self, count: usize, elem_size: usize) -> Option<HeapPtr> {
        self.fill_with(count, elem_size, Placement::Packed, None)
    }

    #[must_use]
    pub fn fill_aligned(&self, count: usize, elem_size: usize) -> Option<HeapPtr> {
        self.fill_with(count, elem_size, Placement::PageAligned, None)
    }

    #[must_use]
    pub fn fill_debug(
        &self,
        count: usize,
        elem_size: usize,
        provenance: Provenance<'_>,
    ) -> Option<HeapPtr> {
        self.fill_with(count, elem_size, Placement::Packed, Some(provenance))
    }

    #[must_use]
    pub fn fill_aligned_debug(
        &self,
        count: usize,
        elem_size: usize,
        provenance: Provenance<'_>,
    ) -> Option<HeapPtr> {
        self.fill_with(count, elem_size, Placement::PageAligned, Some(provenance))
    }

    /// Releases the block whose payload starts at `ptr`.
    ///
    /// Releasing `None` does nothing. The pointer is not checked against the
    /// chain: releasing anything but a live payload start corrupts the heap,
    /// which only [`Heap::validate`] can detect afterwards.
    pub fn release(&self, ptr: impl Into<Option<HeapPtr>>) {
        let Some(ptr) = ptr.into() else {
            return;
        };
        self.state.lock().release(ptr.addr());
        log::trace!("release({ptr:?})");
    }

    /// Moves the payload at `ptr` into a new block of `new_size` bytes.
    ///
    /// `None` allocates; a zero size releases and returns `ptr` itself,
    /// which is no longer valid. On failure `None` is returned and the old
    /// block stays allocated with its contents intact.
    #[must_use]
    pub fn resize(&self, ptr: impl Into<Option<HeapPtr>>, new_size: usize) -> Option<HeapPtr> {
        self.resize_with(ptr.into(), new_size, Placement::Packed, None)
    }

    #[must_use]
    pub fn resize_aligned(
        &self,
        ptr: impl Into<Option<HeapPtr>>,
        new_size: usize,
    ) -> Option<HeapPtr> {
        self.resize_with(ptr.into(), new_size, Placement::PageAligned, None)
    }

    #[must_use]
    pub fn resize_debug(
        &self,
        ptr: impl Into<Option<HeapPtr>>,
        new_size: usize,
        provenance: Provenance<'_>,
    ) -> Option<HeapPtr> {
        self.resize_with(ptr.into(), new_size, Placement::Packed, Some(provenance))
    }

    #[must_use]
    pub fn resize_aligned_debug(
        &self,
        ptr: impl Into<Option<HeapPtr>>,
        new_size: usize,
        provenance: Provenance<'_>,
    ) -> Option<HeapPtr> {
        self.resize_with(
            ptr.into(),
            new_size,
            Placement::PageAligned,
            Some(provenance),
        )
    }

    /// Checks the guard pages and the whole descriptor chain.
    pub fn validate(&self) -> Result<(), ValidateError> {
        let res = self.state.lock().validate();
        if let Err(err) = &res {
            log::warn!("heap validation failed: {err}");
        }
        res
    }

    #[must_use]
    pub fn classify_pointer(&self, ptr: impl Into<Option<HeapPtr>>) -> PointerKind {
        self.state.lock().classify(ptr.into().map(HeapPtr::addr))
    }

    /// Maps a pointer into an allocated payload to the start of that
    /// payload.
    #[must_use]
    pub fn payload_start_of(&self, ptr: HeapPtr) -> Option<HeapPtr> {
        self.state
            .lock()
            .payload_start_of(ptr.addr())
            .and_then(HeapPtr::new)
    }

    /// Returns the payload size of the allocation starting at `ptr`, or `0`
    /// if `ptr` is not the start of an allocated payload.
    #[must_use]
    pub fn payload_size_of(&self, ptr: HeapPtr) -> usize {
        self.state.lock().payload_size_of(ptr.addr())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.state.lock().stats()
    }

    /// Takes a snapshot of every block of the heap.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.state.lock().diagnostics()
    }

    /// Renders [`Heap::diagnostics`] as text.
    #[must_use]
    pub fn dump_diagnostics(&self) -> String {
        self.diagnostics().to_string()
    }

    #[must_use]
    pub fn space_info(&self) -> SpaceInfo {
        self.state.lock().space.info()
    }

    /// Reports whether the guard pages still hold their original contents.
    #[must_use]
    pub fn guard_pages(&self) -> GuardPageStatus {
        self.state.lock().space.guard_pages()
    }

    /// Copies bytes starting at `addr` into `buf`.
    ///
    /// Any address of the arena can be read, guard pages included.
    pub fn read(&self, addr: impl Into<usize>, buf: &mut [u8]) -> Result<(), AccessError> {
        let state = self.state.lock();
        buf.copy_from_slice(state.space.bytes(addr.into(), buf.len())?);
        Ok(())
    }

    /// Reads `len` bytes starting at `addr`.
    pub fn to_vec(&self, addr: impl Into<usize>, len: usize) -> Result<Vec<u8>, AccessError> {
        let state = self.state.lock();
        Ok(state.space.bytes(addr.into(), len)?.to_vec())
    }

    /// Copies `data` to `addr`.
    ///
    /// Nothing stops a write from overrunning a payload or hitting a guard
    /// page; such writes are what [`Heap::validate`] detects.
    pub fn write(&self, addr: impl Into<usize>, data: &[u8]) -> Result<(), AccessError> {
        let mut state = self.state.lock();
        state
            .space
            .bytes_mut(addr.into(), data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    /// Sets `len` bytes starting at `addr` to `value`.
    pub fn write_bytes(
        &self,
        addr: impl Into<usize>,
        value: u8,
        len: usize,
    ) -> Result<(), AccessError> {
        let mut state = self.state.lock();
        state.space.bytes_mut(addr.into(), len)?.fill(value);
        Ok(())
    }
}
