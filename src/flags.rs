//! Flag surface decoded at `create`/`create_in` time.
//!
//! Declared with `bitflags!`, the same way a page table flag set
//! (`paging_defs::PageFlags`) is declared elsewhere in this codebase: one
//! doc comment per flag, all OR-combinable.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// Enable the per-record FNV-1a checksum (§4.1).
        const HAS_CHECKSUM = 0x1;
        /// Enable non-checksum safety checks: double-free / free-bit
        /// disagreement detection.
        const HAS_NON_CHECKSUM_SAFETY_CHECKS = 0x2;
        /// Lowest early-release threshold (4 KiB).
        const KEEP_SIZE_TINY = 0x4;
        /// Early-release threshold of 32 KiB.
        const KEEP_SIZE_SMALL = 0x8;
        /// Early-release threshold of 1 MiB.
        const KEEP_SIZE_LARGE = 0x10;
        /// Disable the SRA entirely; all allocations go through GPA.
        const NO_RR_ALLOCATOR = 0x20;
        /// On SRA OOM, request new memory from GPA rather than directly
        /// from the growth callback.
        const SMA_REQUEST_MEM_FROM_GPA = 0x40;
        /// Add one alignment line of padding to requests at or above
        /// `MIN_SIZE_FOR_SAFETY_PADDING`.
        const HAS_SAFETY_PADDING_LINE = 0x80;
        /// Force a full (non-amortised) checksum check on every access.
        const DENSE_CHECKSUM_CHECKS = 0x100;
        /// Use the no-buckets free-list strategy.
        const DISABLE_BUCKETS = 0x200;
        /// Use the bucket-tree free-list strategy.
        const BUCKET_TREE = 0x400;
        /// Use the bucket-arenas free-list strategy.
        const BUCKET_ARENAS = 0x800;
        /// Skip lock acquisition entirely; the embedder guarantees external
        /// serialisation.
        const ASSUME_THREAD_SAFE_USAGE = 0x1000;
        /// Run the full address/sorted-ring and bucket-table walk on every
        /// public operation (expensive; debug builds only).
        const HEAVY_DEBUG_CORRUPTION_CHECKS = 0x2000;
    }
}

impl HeapFlags {
    pub const HAS_SAFETY_CHECKS: HeapFlags =
        HeapFlags::HAS_CHECKSUM.union(HeapFlags::HAS_NON_CHECKSUM_SAFETY_CHECKS);

    pub const DEFAULT_SETTINGS: HeapFlags = HeapFlags::HAS_SAFETY_CHECKS
        .union(HeapFlags::SMA_REQUEST_MEM_FROM_GPA)
        .union(HeapFlags::HAS_SAFETY_PADDING_LINE)
        .union(HeapFlags::BUCKET_ARENAS);
}

impl Default for HeapFlags {
    fn default() -> Self {
        HeapFlags::DEFAULT_SETTINGS
    }
}

/// Which free-list strategy a validated flag set selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketStrategy {
    NoBuckets,
    BucketArenas,
    BucketTree,
}

impl BucketStrategy {
    pub fn from_flags(flags: HeapFlags) -> Result<Self, crate::error::ConfigError> {
        let selected = [
            flags.contains(HeapFlags::DISABLE_BUCKETS),
            flags.contains(HeapFlags::BUCKET_ARENAS),
            flags.contains(HeapFlags::BUCKET_TREE),
        ];
        match selected.iter().filter(|s| **s).count() {
            0 => Err(crate::error::ConfigError::NoBucketStrategySelected),
            1 => {
                if selected[0] {
                    Ok(BucketStrategy::NoBuckets)
                } else if selected[1] {
                    Ok(BucketStrategy::BucketArenas)
                } else {
                    Ok(BucketStrategy::BucketTree)
                }
            }
            _ => Err(crate::error::ConfigError::MultipleBucketStrategiesSelected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_reference_allocator() {
        let f = HeapFlags::default();
        assert!(f.contains(HeapFlags::HAS_CHECKSUM));
        assert!(f.contains(HeapFlags::HAS_NON_CHECKSUM_SAFETY_CHECKS));
        assert!(f.contains(HeapFlags::SMA_REQUEST_MEM_FROM_GPA));
        assert!(f.contains(HeapFlags::HAS_SAFETY_PADDING_LINE));
        assert!(f.contains(HeapFlags::BUCKET_ARENAS));
    }

    #[test]
    fn bucket_strategy_requires_exactly_one_flag() {
        assert!(BucketStrategy::from_flags(HeapFlags::empty()).is_err());
        assert!(
            BucketStrategy::from_flags(HeapFlags::DISABLE_BUCKETS | HeapFlags::BUCKET_TREE)
                .is_err()
        );
        assert_eq!(
            BucketStrategy::from_flags(HeapFlags::DISABLE_BUCKETS).unwrap(),
            BucketStrategy::NoBuckets
        );
    }
}
