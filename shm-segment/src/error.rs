use std::io;
use thiserror::Error;

/// Failures of a [`SharedSegment`](crate::SharedSegment).
///
/// Every expected failure has its own variant so that callers can decide on a fallback without
/// inspecting messages.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The segment could not be created.
    #[error("failed to create shared segment `{name}`")]
    Creation {
        name: String,
        #[source]
        reason: CreationFailure,
    },
    /// No creator has published a segment under this name.
    #[error("no shared segment named `{name}` has been created")]
    NotFound { name: String },
    /// A record exists but the segment behind it could not be attached.
    #[error("failed to open shared segment `{name}`")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    /// The byte range does not lie within the segment.
    #[error("{len} bytes at offset {offset} exceed the segment size of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// The handle was never mapped, or has been closed.
    #[error("shared segment `{name}` is not mapped")]
    NotMapped { name: String },
    /// Any other failure of the environment.
    #[error("shared segment I/O failed")]
    Io(#[from] io::Error),
}

/// The reason a segment could not be created.
#[derive(Debug, Error)]
pub enum CreationFailure {
    #[error("names must be non-empty and contain neither `/` nor NUL")]
    InvalidName,
    #[error("the size must be greater than zero")]
    ZeroSize,
    /// The name is published by a process which is still running.
    #[error("the name is held by running process {pid}")]
    InUse { pid: u32 },
    #[error("this handle already maps a segment")]
    AlreadyMapped,
    #[error(transparent)]
    Os(#[from] io::Error),
}
