//! A named shared memory segment, addressed purely by offsets.
//!
//! The creating process backs the segment with a sealed `memfd` of fixed size and publishes a
//! small discovery record under a registry directory. Any other process on the same host can then
//! attach to the segment by name: the record tells it where the creator's file descriptor lives,
//! which is re-opened through `/proc` and mapped at whatever address the kernel chooses.
//!
//! Base addresses are never shared. Both sides talk about the segment in `(offset, length)` pairs
//! only; the address in the record exists for diagnostics.
//!
//! ## Lifetime
//!
//! Closing a handle only removes this process's view. When the creator closes, its descriptor is
//! kept open for the rest of the process, so the segment can still be opened by name until the
//! creating process exits. [`SharedSegment::destroy`] withdraws it earlier.
mod error;
pub mod op;
mod registry;
mod segment;


pub use error::{CreationFailure, SegmentError};
pub use registry::{default_dir, Registry, SegmentRecord, REGISTRY_ENV};
pub use segment::{Mapping, Role, SegmentOptions, SharedSegment};
