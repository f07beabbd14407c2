//! Numeric knobs derived from the flag surface at `create`/`create_in` time.
//!
//! Grounded on `internal/virtalloc/allocator_settings.h` /
//! `alloc_settings.h` in the reference allocator.

use crate::flags::{BucketStrategy, HeapFlags};

pub const MIN_LARGE_ALLOCATION_SIZE: usize = 64;
pub const MAX_TINY_ALLOCATION_SIZE: usize = 64;
pub const LARGE_ALLOCATION_ALIGN: usize = 64;
pub const MIN_NEW_MEM_REQUEST_SIZE: usize = 64 * 1024;
pub const MIN_SIZE_FOR_SAFETY_PADDING: usize = 512;

pub const EARLY_RELEASE_SIZE_TINY: usize = 4096;
pub const EARLY_RELEASE_SIZE_SMALL: usize = 32 * 1024;
pub const EARLY_RELEASE_SIZE_NORMAL: usize = 128 * 1024;
pub const EARLY_RELEASE_SIZE_LARGE: usize = 1024 * 1024;

pub const NUM_BUCKETS_DEFAULT: usize = 256;
pub const DEFAULT_MAX_SLOT_CHECKS_BEFORE_OOM: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub flags: HeapFlags,
    pub bucket_strategy: BucketStrategy,
    pub min_size_for_early_release: usize,
    pub max_gpa_slot_checks_before_oom: usize,
    pub max_sra_slot_checks_before_oom: usize,
    pub num_buckets: usize,
}

impl Config {
    pub fn from_flags(flags: HeapFlags) -> Result<Self, crate::error::ConfigError> {
        let bucket_strategy = BucketStrategy::from_flags(flags)?;
        let min_size_for_early_release = if flags.contains(HeapFlags::KEEP_SIZE_TINY) {
            EARLY_RELEASE_SIZE_TINY
        } else if flags.contains(HeapFlags::KEEP_SIZE_SMALL) {
            EARLY_RELEASE_SIZE_SMALL
        } else if flags.contains(HeapFlags::KEEP_SIZE_LARGE) {
            EARLY_RELEASE_SIZE_LARGE
        } else {
            EARLY_RELEASE_SIZE_NORMAL
        };
        Ok(Config {
            flags,
            bucket_strategy,
            min_size_for_early_release,
            max_gpa_slot_checks_before_oom: DEFAULT_MAX_SLOT_CHECKS_BEFORE_OOM,
            max_sra_slot_checks_before_oom: DEFAULT_MAX_SLOT_CHECKS_BEFORE_OOM,
            num_buckets: NUM_BUCKETS_DEFAULT,
        })
    }

    pub fn checksums_enabled(&self) -> bool {
        self.flags.contains(HeapFlags::HAS_CHECKSUM)
    }

    pub fn safety_checks_enabled(&self) -> bool {
        self.flags.contains(HeapFlags::HAS_NON_CHECKSUM_SAFETY_CHECKS)
    }

    pub fn heavy_debug_enabled(&self) -> bool {
        self.flags.contains(HeapFlags::HEAVY_DEBUG_CORRUPTION_CHECKS)
    }

    pub fn sra_enabled(&self) -> bool {
        !self.flags.contains(HeapFlags::NO_RR_ALLOCATOR)
    }

    pub fn sma_requests_from_gpa(&self) -> bool {
        self.flags.contains(HeapFlags::SMA_REQUEST_MEM_FROM_GPA)
    }

    /// Default padding-lines policy: one alignment line for requests at or
    /// above `MIN_SIZE_FOR_SAFETY_PADDING`, zero otherwise. Configurable in
    /// spirit (callers who want a different policy can bypass `Config` and
    /// pad the size they pass to `allocate` themselves).
    pub fn padding_lines(&self, raw_size: usize) -> usize {
        if !self.flags.contains(HeapFlags::HAS_SAFETY_PADDING_LINE) {
            return 0;
        }
        if raw_size >= MIN_SIZE_FOR_SAFETY_PADDING {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_line_added_only_above_threshold() {
        let cfg = Config::from_flags(HeapFlags::default()).unwrap();
        assert_eq!(cfg.padding_lines(16), 0);
        assert_eq!(cfg.padding_lines(MIN_SIZE_FOR_SAFETY_PADDING), 1);
    }

    #[test]
    fn keep_size_flag_selects_threshold() {
        let cfg = Config::from_flags(HeapFlags::default() | HeapFlags::KEEP_SIZE_TINY).unwrap();
        assert_eq!(cfg.min_size_for_early_release, EARLY_RELEASE_SIZE_TINY);
    }
}
