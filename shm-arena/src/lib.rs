//! An arena allocator over a named shared memory segment.
//!
//! One process creates the arena with [`IpcAllocator::init`] and is expected to be the only one
//! to allocate and free. Any number of other processes attach with [`IpcAllocator::open`] and
//! recover the complete allocation table from the segment itself, without talking to the creator.
//!
//! The first `header_size` bytes of the segment hold that table as a JSON document. It is
//! rewritten on every `malloc` and `free`, so an opener never finds it stale. The rest of the
//! segment is handed out by a bump pointer in units of 8 bytes; freed space is not reused.
//!
//! ```rust,ignore
//! use shm_arena::{ArenaOptions, IpcAllocator, Payload};
//!
//! let mut writer = IpcAllocator::new(ArenaOptions::new("stats", 1 << 16));
//! writer.init()?;
//! let block = writer.malloc(100, "json")?;
//! writer.write_json(block.offset, &[1, 2, 3])?;
//!
//! // In another process.
//! let mut reader = IpcAllocator::new(ArenaOptions::new("stats", 1 << 16));
//! reader.open()?;
//! assert!(matches!(reader.read(block.offset)?, Payload::Json(_)));
//! ```
mod allocator;
mod config;
mod error;
mod header;
mod payload;
mod stats;

#[cfg(test)]
mod tests;

pub use allocator::{Allocation, Block, IpcAllocator, ALIGNMENT};
pub use config::{
    parse_size, ArenaOptions, EnvError, ParseSizeError, DEFAULT_NAME, DEFAULT_SIZE,
    HEADER_SIZE_ENV, NAME_ENV, SIZE_ENV,
};
pub use error::ArenaError;
pub use header::{Header, HeaderEntry, HeaderError, DEFAULT_HEADER_SIZE, HEADER_VERSION};
pub use payload::{Payload, PayloadKind};
pub use stats::ArenaStats;

pub use shm_segment::{SegmentError, REGISTRY_ENV};
