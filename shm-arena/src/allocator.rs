use std::collections::BTreeMap;

use serde::Serialize;
use shm_segment::SharedSegment;

use crate::{ArenaError, ArenaOptions, ArenaStats, Header, HeaderError, Payload, PayloadKind};

/// Every allocation size is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// One live allocation in the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub offset: usize,
    /// The aligned size.
    pub size: usize,
    pub kind: PayloadKind,
}

/// The range handed out by [`IpcAllocator::malloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub offset: usize,
    pub size: usize,
}

/// A bump allocator over a [`SharedSegment`], with its table stored in the segment.
///
/// The allocator is inert until [`init`](Self::init) or [`open`](Self::open) succeeds, and
/// again after [`close`](Self::close). All other operations fail with `NotInitialized` in
/// that state.
///
/// Only one process should `malloc` and `free`. Nothing prevents two writers, but they would
/// race on the bump pointer and the table.
pub struct IpcAllocator {
    segment: SharedSegment,
    header_size: usize,
    next_offset: usize,
    allocations: BTreeMap<usize, Allocation>,
    initialized: bool,
}

impl IpcAllocator {
    pub fn new(options: ArenaOptions) -> Self {
        IpcAllocator {
            segment: SharedSegment::new(options.segment()),
            header_size: options.header_size,
            next_offset: 0,
            allocations: BTreeMap::new(),
            initialized: false,
        }
    }

    /// Create the segment and write an empty table.
    ///
    /// Returns the size of the segment. Does nothing if the allocator is already usable. On
    /// failure the allocator stays uninitialized and the call may be retried.
    pub fn init(&mut self) -> Result<usize, ArenaError> {
        if self.initialized {
            return Ok(self.segment.size());
        }

        match self.try_init() {
            Ok(size) => {
                self.initialized = true;
                tracing::info!(name = %self.name(), size, header = self.header_size, "initialized arena");
                Ok(size)
            }
            Err(err) => {
                // A table was never written, nobody should find this segment.
                self.segment.destroy();
                self.reset();
                Err(err)
            }
        }
    }

    /// Attach to an existing segment and recover its table.
    ///
    /// The bump pointer is recovered as the end of the last live allocation. Returns the size of
    /// the segment as published by its creator.
    pub fn open(&mut self) -> Result<usize, ArenaError> {
        if self.initialized {
            return Ok(self.segment.size());
        }

        match self.try_open() {
            Ok(size) => {
                self.initialized = true;
                tracing::info!(
                    name = %self.name(),
                    size,
                    allocations = self.allocations.len(),
                    "opened arena"
                );
                Ok(size)
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Re-read the table from the segment.
    ///
    /// An opener only learns about allocations made after it attached by calling this.
    pub fn refresh(&mut self) -> Result<(), ArenaError> {
        self.ensure_ready()?;
        self.load_header()
    }

    /// Allocate `size` bytes, rounded up to the alignment, tagged with the payload type `kind`.
    ///
    /// The table in the segment is updated before this returns.
    pub fn malloc(&mut self, size: usize, kind: &str) -> Result<Block, ArenaError> {
        self.ensure_ready()?;

        if size == 0 {
            return Err(ArenaError::ZeroSized);
        }

        let available = self.segment.size().saturating_sub(self.next_offset);
        let Some(aligned) = align_up(size).filter(|&aligned| aligned <= available) else {
            return Err(ArenaError::OutOfMemory {
                requested: size,
                available,
            });
        };

        let offset = self.next_offset;
        self.allocations.insert(
            offset,
            Allocation {
                offset,
                size: aligned,
                kind: PayloadKind::from_tag(kind),
            },
        );
        self.next_offset = offset + aligned;

        if let Err(err) = self.write_header() {
            self.allocations.remove(&offset);
            self.next_offset = offset;
            return Err(err);
        }

        tracing::debug!(offset, size = aligned, kind, "allocated");
        Ok(Block {
            offset,
            size: aligned,
        })
    }

    /// Release the allocation at `offset`.
    ///
    /// The space is not handed out again.
    pub fn free(&mut self, offset: usize) -> Result<(), ArenaError> {
        self.ensure_ready()?;

        let Some(removed) = self.allocations.remove(&offset) else {
            return Err(ArenaError::InvalidOffset { offset });
        };

        if let Err(err) = self.write_header() {
            self.allocations.insert(offset, removed);
            return Err(err);
        }

        tracing::debug!(offset, size = removed.size, "freed");
        Ok(())
    }

    /// Replace the contents of the allocation at `offset`.
    ///
    /// Bytes of the allocation past the end of `data` are zeroed.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<usize, ArenaError> {
        let size = self.live(offset)?.size;

        if data.len() > size {
            return Err(ArenaError::AllocationSizeExceeded {
                offset,
                len: data.len(),
                size,
            });
        }

        let mut slot = Vec::with_capacity(size);
        slot.extend_from_slice(data);
        slot.resize(size, 0);

        self.segment.write(offset, &slot)?;
        Ok(data.len())
    }

    /// Write `value` as JSON into the allocation at `offset`.
    pub fn write_json<T: Serialize + ?Sized>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<usize, ArenaError> {
        let encoded = serde_json::to_vec(value).map_err(ArenaError::Encode)?;
        self.write(offset, &encoded)
    }

    /// Read the complete allocation at `offset`, decoded according to its kind.
    pub fn read(&self, offset: usize) -> Result<Payload, ArenaError> {
        let allocation = self.live(offset)?;
        let bytes = self.segment.read(offset, allocation.size)?;
        Ok(Payload::decode(&allocation.kind, bytes))
    }

    pub fn stats(&self) -> Result<ArenaStats, ArenaError> {
        self.ensure_ready()?;
        Ok(ArenaStats::compute(
            self.segment.size(),
            self.allocations.values(),
        ))
    }

    /// Unmap the segment and forget the table. Does nothing if not initialized.
    ///
    /// An arena closed by its creator can still be opened, with its table intact, until the
    /// creating process exits.
    pub fn close(&mut self) {
        if self.initialized {
            tracing::info!(name = %self.name(), "closing arena");
        }

        self.reset();
    }

    /// Close, and also withdraw the arena if this allocator created it.
    ///
    /// Allocators that are already attached keep working, new ones can no longer open it.
    pub fn destroy(&mut self) {
        if self.initialized {
            tracing::info!(name = %self.name(), "destroying arena");
        }

        self.segment.destroy();
        self.reset();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    /// Live allocations, ordered by offset.
    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> + '_ {
        self.allocations.values()
    }

    pub fn allocation(&self, offset: usize) -> Option<&Allocation> {
        self.allocations.get(&offset)
    }

    fn try_init(&mut self) -> Result<usize, ArenaError> {
        self.check_layout()?;
        self.segment.create()?;

        self.allocations.clear();
        self.next_offset = self.header_size;
        self.write_header()?;

        Ok(self.segment.size())
    }

    fn try_open(&mut self) -> Result<usize, ArenaError> {
        self.segment.open()?;
        // The creator's size may differ from the configured one.
        self.check_layout()?;
        self.load_header()?;

        Ok(self.segment.size())
    }

    fn load_header(&mut self) -> Result<(), ArenaError> {
        let region = self.segment.read(0, self.header_size)?;
        let header = Header::decode(&region)?;
        header.validate(self.header_size)?;

        if header.total_size != self.segment.size() {
            return Err(HeaderError::Inconsistent(format!(
                "table describes {} bytes but the segment holds {}",
                header.total_size,
                self.segment.size()
            ))
            .into());
        }

        let mut allocations = BTreeMap::new();
        let mut next_offset = self.header_size;

        for entry in header.allocations {
            next_offset = next_offset.max(entry.offset + entry.size);
            allocations.insert(
                entry.offset,
                Allocation {
                    offset: entry.offset,
                    size: entry.size,
                    kind: PayloadKind::from_tag(&entry.kind),
                },
            );
        }

        self.allocations = allocations;
        self.next_offset = next_offset;
        Ok(())
    }

    /// Replace the table in the segment with the current one.
    fn write_header(&mut self) -> Result<(), ArenaError> {
        let header = Header::from_table(self.segment.size(), self.allocations.values());

        let bytes = match header.encode(self.header_size) {
            Ok(bytes) => bytes,
            Err(HeaderError::Overflow { needed, capacity }) => {
                tracing::warn!(
                    name = %self.name(),
                    needed,
                    capacity,
                    allocations = header.allocation_count,
                    "allocation table does not fit the header region"
                );
                return Err(ArenaError::HeaderOverflow { needed, capacity });
            }
            Err(err) => return Err(err.into()),
        };

        self.segment.write(0, &bytes)?;
        tracing::debug!(allocations = header.allocation_count, "rewrote allocation table");
        Ok(())
    }

    fn check_layout(&self) -> Result<(), ArenaError> {
        let size = self.segment.size();
        if self.header_size > size {
            return Err(ArenaError::InvalidLayout {
                header_size: self.header_size,
                size,
            });
        }

        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), ArenaError> {
        if self.initialized {
            Ok(())
        } else {
            Err(ArenaError::NotInitialized)
        }
    }

    fn live(&self, offset: usize) -> Result<&Allocation, ArenaError> {
        self.ensure_ready()?;
        self.allocations
            .get(&offset)
            .ok_or(ArenaError::InvalidOffset { offset })
    }

    fn reset(&mut self) {
        self.segment.close();
        self.allocations.clear();
        self.next_offset = 0;
        self.initialized = false;
    }
}

fn align_up(size: usize) -> Option<usize> {
    size.checked_add(ALIGNMENT - 1)
        .map(|padded| padded & !(ALIGNMENT - 1))
}
