use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use memfile::{MemFile, Seal};
use memmap2::MmapRaw;

use crate::registry::{self, Registry, SegmentRecord};
use crate::{op, CreationFailure, SegmentError};

/// Identifies a segment: its name, its size and where its record is published.
#[derive(Clone, Debug)]
pub struct SegmentOptions {
    pub name: String,
    /// The size in bytes. Openers adopt the size published by the creator.
    pub size: usize,
    /// The directory holding discovery records.
    pub registry: PathBuf,
}

/// How this process came to hold the segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Creator,
    Opener,
}

/// Where the segment is mapped in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub address: usize,
    pub size: usize,
}

/// A handle to one named shared memory segment.
///
/// The handle starts out unmapped. Exactly one of [`create`](Self::create) or
/// [`open`](Self::open) maps it; [`close`](Self::close) unmaps it again.
pub struct SharedSegment {
    name: String,
    size: usize,
    registry: Registry,
    mapped: Option<Mapped>,
    /// The descriptor this handle left behind when it closed as the creator.
    lingering: Option<RawFd>,
}

struct Mapped {
    map: MmapRaw,
    /// The memfd. For the creator, this is the descriptor that openers re-open.
    file: File,
    role: Role,
}

/// Segments whose creator closed its handle, while the process still runs.
///
/// Openers re-open the creator's descriptor, so it stays open until the process exits, the name
/// is created again or the segment is destroyed.
static LINGERING: Mutex<Vec<Lingering>> = Mutex::new(Vec::new());

struct Lingering {
    record: PathBuf,
    file: File,
}

impl SegmentOptions {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        SegmentOptions {
            name: name.into(),
            size,
            registry: registry::default_dir(),
        }
    }
}

impl SharedSegment {
    pub fn new(options: SegmentOptions) -> Self {
        SharedSegment {
            name: options.name,
            size: options.size,
            registry: Registry::new(options.registry),
            mapped: None,
            lingering: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn role(&self) -> Option<Role> {
        self.mapped.as_ref().map(|mapped| mapped.role)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_path(&self) -> PathBuf {
        self.registry.record_path(&self.name)
    }

    /// Create a new segment and publish it under its name.
    ///
    /// A record left behind by a process that no longer runs, or by a handle of this process that
    /// has closed, is replaced.
    pub fn create(&mut self) -> Result<Mapping, SegmentError> {
        if self.mapped.is_some() {
            return Err(self.creation(CreationFailure::AlreadyMapped));
        }

        if !is_valid_name(&self.name) {
            return Err(self.creation(CreationFailure::InvalidName));
        }

        if self.size == 0 {
            return Err(self.creation(CreationFailure::ZeroSize));
        }

        match self.registry.lookup(&self.name) {
            Ok(Some(record))
                if record.pid == op::current_pid()
                    && release_lingering(&self.record_path(), record.fd).is_some() =>
            {
                tracing::debug!(name = %self.name, "replacing a segment closed by this process");
                self.registry
                    .remove(&self.name)
                    .map_err(|err| self.creation(err.into()))?;
            }
            Ok(Some(record)) if op::holds_file(record.pid, record.fd, record.size) => {
                return Err(self.creation(CreationFailure::InUse { pid: record.pid }));
            }
            Ok(Some(record)) => {
                tracing::debug!(name = %self.name, pid = record.pid, "replacing stale segment record");
                self.registry
                    .remove(&self.name)
                    .map_err(|err| self.creation(err.into()))?;
            }
            Ok(None) => {}
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(name = %self.name, "replacing unreadable segment record: {err}");
                self.registry
                    .remove(&self.name)
                    .map_err(|err| self.creation(err.into()))?;
            }
            Err(err) => return Err(self.creation(err.into())),
        }

        let (file, map) =
            create_memfd(&self.name, self.size).map_err(|err| self.creation(err.into()))?;

        let record = SegmentRecord {
            name: self.name.clone(),
            size: self.size,
            address: map.as_ptr() as usize,
            created_at: unix_now(),
            pid: op::current_pid(),
            fd: file.as_raw_fd(),
        };

        match self.registry.publish(&record) {
            Ok(_) => {}
            // Lost a race against another creator.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let pid = self
                    .registry
                    .lookup(&self.name)
                    .ok()
                    .flatten()
                    .map_or(0, |record| record.pid);
                return Err(self.creation(CreationFailure::InUse { pid }));
            }
            Err(err) => return Err(self.creation(err.into())),
        }

        let mapping = Mapping {
            address: record.address,
            size: self.size,
        };

        tracing::info!(name = %self.name, size = self.size, fd = record.fd, "created shared segment");
        self.lingering = None;
        self.mapped = Some(Mapped {
            map,
            file,
            role: Role::Creator,
        });

        Ok(mapping)
    }

    /// Attach to the segment published under this name.
    ///
    /// The size recorded by the creator takes precedence over the configured one.
    pub fn open(&mut self) -> Result<Mapping, SegmentError> {
        if self.mapped.is_some() {
            return Err(self.open_error(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "this handle already maps a segment",
            )));
        }

        let record = match self.registry.lookup(&self.name) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(SegmentError::NotFound {
                    name: self.name.clone(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(self.open_error(err))
            }
            Err(err) => return Err(SegmentError::Io(err)),
        };

        if record.name != self.name {
            return Err(self.open_error(invalid_data(format!(
                "record describes segment `{}`",
                record.name
            ))));
        }

        let path = op::fd_path(record.pid, record.fd);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                if !op::is_alive(record.pid) {
                    tracing::debug!(name = %self.name, pid = record.pid, "segment creator has exited");
                }

                return Err(self.open_error(err));
            }
        };

        let len = file.metadata().map_err(|err| self.open_error(err))?.len();
        if u64::try_from(record.size).ok() != Some(len) {
            return Err(self.open_error(invalid_data(format!(
                "segment holds {len} bytes but its record claims {}",
                record.size
            ))));
        }

        let map = MmapRaw::map_raw(&file).map_err(|err| self.open_error(err))?;

        if record.size != self.size {
            tracing::warn!(
                name = %self.name,
                configured = self.size,
                recorded = record.size,
                "adopting the size recorded by the segment creator"
            );
            self.size = record.size;
        }

        let mapping = Mapping {
            address: map.as_ptr() as usize,
            size: self.size,
        };

        tracing::info!(name = %self.name, size = self.size, creator = record.pid, "opened shared segment");
        self.mapped = Some(Mapped {
            map,
            file,
            role: Role::Opener,
        });

        Ok(mapping)
    }

    /// Copy `data` into the segment at `offset`.
    ///
    /// The bytes are visible to every subsequent `read`, in this process or another, once this
    /// returns.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<usize, SegmentError> {
        let map = self.map()?;
        self.check_range(offset, data.len())?;

        // Safety: the range is within the mapping, which lives as long as `self`. Other processes
        // may access the same bytes concurrently; they are plain bytes, so the worst outcome is a
        // torn value which the single-writer discipline rules out for well-behaved peers.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), map.as_mut_ptr().add(offset), data.len());
        }

        fence(Ordering::Release);
        Ok(data.len())
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, SegmentError> {
        self.check_range(offset, len)?;
        let mut buffer = vec![0; len];
        self.read_into(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Fill `buffer` with the bytes at `offset`.
    pub fn read_into(&self, offset: usize, buffer: &mut [u8]) -> Result<(), SegmentError> {
        let map = self.map()?;
        self.check_range(offset, buffer.len())?;
        fence(Ordering::Acquire);

        // Safety: see `write`.
        unsafe {
            core::ptr::copy_nonoverlapping(map.as_ptr().add(offset), buffer.as_mut_ptr(), buffer.len());
        }

        Ok(())
    }

    /// Unmap the segment.
    ///
    /// The segment stays attachable by name after the creator closes, until the creating process
    /// exits, the name is created again or [`destroy`](Self::destroy) is called. Calling this on an
    /// unmapped handle does nothing.
    pub fn close(&mut self) {
        let Some(Mapped { map, file, role }) = self.mapped.take() else {
            return;
        };

        drop(map);

        if role == Role::Creator {
            self.lingering = Some(file.as_raw_fd());
            linger(self.record_path(), file);
        }

        tracing::info!(name = %self.name, "closed shared segment");
    }

    /// Close the handle and withdraw the segment, so that no new opener finds it.
    ///
    /// Only affects a segment this handle created. Openers that are already attached keep their
    /// view.
    pub fn destroy(&mut self) {
        self.close();

        let Some(fd) = self.lingering.take() else {
            return;
        };

        let Some(file) = release_lingering(&self.record_path(), fd) else {
            // The name was created again in the meantime.
            return;
        };

        if let Err(err) = self.registry.retract(&self.name, op::current_pid(), fd) {
            tracing::warn!(name = %self.name, "failed to withdraw segment record: {err}");
        }

        drop(file);
        tracing::info!(name = %self.name, "destroyed shared segment");
    }

    fn map(&self) -> Result<&MmapRaw, SegmentError> {
        match &self.mapped {
            Some(mapped) => Ok(&mapped.map),
            None => Err(SegmentError::NotMapped {
                name: self.name.clone(),
            }),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), SegmentError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SegmentError::OutOfRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn creation(&self, reason: CreationFailure) -> SegmentError {
        SegmentError::Creation {
            name: self.name.clone(),
            reason,
        }
    }

    fn open_error(&self, source: io::Error) -> SegmentError {
        SegmentError::Open {
            name: self.name.clone(),
            source,
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.close();
    }
}

fn lingering() -> MutexGuard<'static, Vec<Lingering>> {
    LINGERING.lock().unwrap_or_else(PoisonError::into_inner)
}

fn linger(record: PathBuf, file: File) {
    lingering().push(Lingering { record, file });
}

fn release_lingering(record: &Path, fd: RawFd) -> Option<File> {
    let mut held = lingering();
    let idx = held
        .iter()
        .position(|entry| entry.record == record && entry.file.as_raw_fd() == fd)?;
    Some(held.swap_remove(idx).file)
}

fn create_memfd(name: &str, size: usize) -> Result<(File, MmapRaw), io::Error> {
    let len = u64::try_from(size).map_err(|_| invalid_data("size exceeds the file size range"))?;

    let memfd = MemFile::create_sealable(name)?;
    memfd.set_len(len)?;
    // The size is fixed for the lifetime of the segment.
    memfd.add_seal(Seal::Shrink)?;
    memfd.add_seal(Seal::Grow)?;

    let file = memfd.into_file();
    let map = MmapRaw::map_raw(&file)?;
    Ok((file, map))
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(|c| c == '/' || c == '\0')
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}
