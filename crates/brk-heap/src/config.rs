//! Heap construction parameters.

use rand::{SeedableRng as _, rngs::StdRng};

use crate::space::PAGE_SIZE;

/// Number of usable pages in a default arena (64 MiB).
pub const DEFAULT_PAGES: usize = 16384;

/// Parameters of a simulated address space.
///
/// The configuration only fixes the arena geometry and how its guard pages
/// are seeded; the heap itself is created by [`Heap::setup`].
///
/// # Examples
///
/// ```
/// use brk_heap::{Heap, HeapConfig};
///
/// let config = HeapConfig::new().with_pages(16).with_guard_seed(7);
/// assert_eq!(config.capacity(), 16 * 4096);
///
/// let heap = Heap::new(config);
/// heap.setup().unwrap();
/// ```
///
/// [`Heap::setup`]: crate::Heap::setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pages: usize,
    guard_seed: Option<u64>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    /// Creates the default configuration: [`DEFAULT_PAGES`] usable pages and
    /// guard pages seeded from the operating system.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: DEFAULT_PAGES,
            guard_seed: None,
        }
    }

    /// Sets the number of usable pages between the two guard pages.
    ///
    /// The break can never reach the end of the usable area, so an arena of
    /// one page cannot even hold the initial heap page.
    #[must_use]
    pub const fn with_pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    /// Seeds the guard page contents deterministically.
    #[must_use]
    pub const fn with_guard_seed(mut self, seed: u64) -> Self {
        self.guard_seed = Some(seed);
        self
    }

    /// Returns the number of usable pages.
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the guard page seed, if one was set.
    #[must_use]
    pub const fn guard_seed(&self) -> Option<u64> {
        self.guard_seed
    }

    /// Returns the usable capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub(crate) fn guard_rng(&self) -> StdRng {
        match self.guard_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
