use core::num::NonZeroUsize;

/// An address inside a simulated address space.
///
/// Addresses are byte offsets from the start of the arena, which begins on a
/// page boundary, so `ptr.addr() % PAGE_SIZE` is the page offset the pointer
/// would have in a real address space. Address `0` lies inside the first
/// guard page and is used as the null value, which makes `Option<HeapPtr>`
/// the counterpart of a nullable pointer.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Debug, derive_more::Display,
)]
#[debug("HeapPtr({:#x})", _0)]
#[display("{:#x}", _0)]
pub struct HeapPtr(NonZeroUsize);

impl HeapPtr {
    /// Creates a pointer from a raw address; `0` yields `None`.
    #[must_use]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Returns a pointer `count` bytes further, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, count: usize) -> Option<Self> {
        match self.0.checked_add(count) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns a pointer `count` bytes before this one, or `None` if that
    /// would be null or below it.
    #[must_use]
    pub const fn checked_sub(self, count: usize) -> Option<Self> {
        match self.0.get().checked_sub(count) {
            Some(addr) => Self::new(addr),
            None => None,
        }
    }

    /// Returns `true` if the address is a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is zero.
    #[must_use]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0.get().is_multiple_of(align)
    }
}

impl From<HeapPtr> for usize {
    fn from(ptr: HeapPtr) -> Self {
        ptr.addr()
    }
}
