//! Point-in-time snapshot of a heap.

use core::fmt;

use crate::{
    descriptor::SourceLocation,
    heap::HeapState,
    ptr::HeapPtr,
    space::{GuardPageStatus, SpaceInfo},
    validate::HeapStats,
};

/// One block of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub descriptor: HeapPtr,
    pub payload: HeapPtr,
    pub size: usize,
    pub free: bool,
    pub provenance: Option<SourceLocation>,
}

/// Every block of a heap together with its totals.
///
/// The `Display` rendering is meant for humans and is not stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub blocks: Vec<BlockInfo>,
    pub stats: HeapStats,
    pub space: SpaceInfo,
    pub guard_pages: GuardPageStatus,
}

impl HeapState {
    pub(crate) fn diagnostics(&self) -> Diagnostics {
        let blocks = self
            .blocks()
            .filter_map(|block| {
                Some(BlockInfo {
                    descriptor: HeapPtr::new(block.at)?,
                    payload: HeapPtr::new(block.payload())?,
                    size: block.desc.payload_size(),
                    free: block.desc.is_free(),
                    provenance: block.desc.provenance(),
                })
            })
            .collect();
        Diagnostics {
            blocks,
            stats: self.stats(),
            space: self.space.info(),
            guard_pages: self.space.guard_pages(),
        }
    }
}

const fn intact(intact: bool) -> &'static str {
    if intact { "intact" } else { "CORRUPTED" }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            blocks,
            stats,
            space,
            guard_pages,
        } = self;

        writeln!(
            f,
            "heap {:#x}..{:#x} ({} of {} bytes reserved)",
            space.start_break,
            space.current_break,
            space.reserved(),
            space.capacity(),
        )?;
        writeln!(
            f,
            "{:>12} {:>12} {:>10}  {:<4}  source",
            "descriptor", "payload", "size", "state"
        )?;
        for block in blocks {
            let state = if block.free { "free" } else { "used" };
            write!(
                f,
                "{:>12} {:>12} {:>10}  {state:<4}",
                block.descriptor.to_string(),
                block.payload.to_string(),
                block.size,
            )?;
            if let Some(provenance) = &block.provenance {
                write!(f, "  {}:{}", provenance.file, provenance.line)?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "in use: {} bytes in {} blocks (largest {})",
            stats.bytes_in_use, stats.used_count, stats.largest_used
        )?;
        writeln!(
            f,
            "free: {} bytes in {} gaps (largest {})",
            stats.bytes_free, stats.free_gap_count, stats.largest_free
        )?;
        write!(
            f,
            "guard pages: first {}, last {}",
            intact(guard_pages.first_intact),
            intact(guard_pages.last_intact),
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use crate::{Heap, HeapConfig, Provenance, descriptor::DESCRIPTOR_SIZE};

    #[test]
    fn test_snapshot() {
        let heap = Heap::new(HeapConfig::new().with_pages(4).with_guard_seed(17));
        heap.setup().unwrap();
        let a = heap
            .allocate_debug(100, Provenance::new("lib.rs", 3))
            .unwrap();

        let diagnostics = heap.diagnostics();
        assert_eq!(diagnostics.blocks.len(), 2);
        let first = &diagnostics.blocks[0];
        assert_eq!(first.payload, a);
        assert_eq!(first.descriptor.addr(), a.addr() - DESCRIPTOR_SIZE);
        assert_eq!(first.size, 100);
        assert!(!first.free);
        assert_eq!(first.provenance.as_ref().unwrap().line, 3);
        assert!(diagnostics.blocks[1].free);
        assert_eq!(diagnostics.stats, heap.stats());
    }

    #[test]
    fn test_dump_mentions_every_block() {
        let heap = Heap::new(HeapConfig::new().with_pages(4).with_guard_seed(17));
        heap.setup().unwrap();
        let a = heap.allocate_debug(100, Provenance::new("lib.rs", 3)).unwrap();
        let _b = heap.allocate(200).unwrap();

        let dump = heap.dump_diagnostics();
        assert!(dump.contains(&a.to_string()));
        assert!(dump.contains("lib.rs:3"));
        assert_eq!(dump.matches("used").count(), 2);
        assert_eq!(dump.matches(" free").count(), 1);
        assert!(dump.ends_with("guard pages: first intact, last intact"));
    }
}
