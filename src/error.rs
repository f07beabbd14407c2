//! Recoverable error type for the allocator's public, hosted-language API.
//!
//! Only the two error kinds that can be surfaced as a value rather than a
//! process abort live here — see `diag::fatal` for the other two
//! (`PreconditionViolation`, `MetadataCorruption`), which never return.

use core::fmt;

/// Recoverable failure from a public allocator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// `malloc`/`realloc` ran out of memory and the growth-and-retry
    /// sequence (if a growth callback was installed) also failed.
    AllocationFailure,
    /// `create`/`create_in` was asked to build an allocator over a region
    /// too small to hold its own header plus one minimum slot, or with an
    /// invalid combination of bucket-strategy flags.
    InvalidConfiguration(ConfigError),
}

/// Why a `create`/`create_in` call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    RegionTooSmall { have: usize, need: usize },
    NoBucketStrategySelected,
    MultipleBucketStrategiesSelected,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure => write!(f, "allocation failed: out of memory"),
            Self::InvalidConfiguration(reason) => {
                write!(f, "invalid allocator configuration: {}", reason)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionTooSmall { have, need } => {
                write!(f, "region of {} bytes is smaller than the {} bytes required for the allocator header and one minimum slot", have, need)
            }
            Self::NoBucketStrategySelected => {
                write!(f, "exactly one of DISABLE_BUCKETS/BUCKET_TREE/BUCKET_ARENAS must be set")
            }
            Self::MultipleBucketStrategiesSelected => {
                write!(f, "only one of DISABLE_BUCKETS/BUCKET_TREE/BUCKET_ARENAS may be set")
            }
        }
    }
}

impl std::error::Error for HeapError {}
impl std::error::Error for ConfigError {}

/// Convenience result type for allocator creation.
pub type HeapResult<T = ()> = Result<T, HeapError>;
