use shm_segment::SegmentError;
use thiserror::Error;

use crate::HeaderError;

/// Failures of an [`IpcAllocator`](crate::IpcAllocator).
///
/// A host should treat any error from `init` or `open` as the shared memory path being
/// unavailable. Nothing here is retried internally.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("the allocator has not been initialized or opened")]
    NotInitialized,
    #[error("cannot allocate {requested} bytes, {available} bytes remain")]
    OutOfMemory { requested: usize, available: usize },
    #[error("zero-sized allocations are not supported")]
    ZeroSized,
    #[error("no live allocation at offset {offset}")]
    InvalidOffset { offset: usize },
    #[error("{len} bytes do not fit the {size} byte allocation at offset {offset}")]
    AllocationSizeExceeded {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// The allocation table no longer fits the reserved header region.
    #[error("the allocation table needs {needed} bytes but only {capacity} are reserved")]
    HeaderOverflow { needed: usize, capacity: usize },
    #[error("unusable allocation table")]
    Header(#[source] HeaderError),
    #[error("a header of {header_size} bytes does not fit a segment of {size} bytes")]
    InvalidLayout { header_size: usize, size: usize },
    #[error("failed to encode the payload")]
    Encode(#[source] serde_json::Error),
}

impl From<HeaderError> for ArenaError {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::Overflow { needed, capacity } => {
                ArenaError::HeaderOverflow { needed, capacity }
            }
            other => ArenaError::Header(other),
        }
    }
}
