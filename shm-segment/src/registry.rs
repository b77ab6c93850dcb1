//! Discovery records, the only state a creator shares with openers outside the segment itself.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the registry directory.
pub const REGISTRY_ENV: &str = "SHM_ARENA_DIR";

/// Published by the creator of a segment, one file per segment name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub name: String,
    pub size: usize,
    /// The base address in the creator. Only meaningful within that process.
    pub address: usize,
    /// Unix time in seconds.
    pub created_at: u64,
    pub pid: u32,
    pub fd: i32,
}

/// A directory of discovery records.
#[derive(Clone, Debug)]
pub struct Registry {
    dir: PathBuf,
}

/// The registry directory used when none is configured.
///
/// Prefers `$SHM_ARENA_DIR`, then the user's runtime directory, then the temporary directory.
pub fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(REGISTRY_ENV) {
        return PathBuf::from(dir);
    }

    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("shm-arena")
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Registry { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Find the record of a segment.
    ///
    /// A record that exists but does not parse is reported with `InvalidData`.
    pub fn lookup(&self, name: &str) -> Result<Option<SegmentRecord>, io::Error> {
        let bytes = match fs::read(self.record_path(name)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let record = serde_json::from_slice(&bytes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(record))
    }

    /// Atomically publish a record, refusing to replace an existing one.
    pub fn publish(&self, record: &SegmentRecord) -> Result<PathBuf, io::Error> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.name);

        // Readers must never observe a partial record, so write it in full next to its final
        // location first.
        let mut pending = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut pending, record)?;
        pending.flush()?;

        pending.persist_noclobber(&path).map_err(|err| err.error)?;
        Ok(path)
    }

    /// Remove the record of `name`, whoever published it.
    pub fn remove(&self, name: &str) -> Result<(), io::Error> {
        match fs::remove_file(self.record_path(name)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Remove the record of `name` if it still describes the given descriptor of the given process.
    ///
    /// Returns whether a record was removed.
    pub fn retract(&self, name: &str, pid: u32, fd: i32) -> Result<bool, io::Error> {
        match self.lookup(name) {
            Ok(Some(record)) if record.pid == pid && record.fd == fd => {
                self.remove(name)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
fn sample(name: &str) -> SegmentRecord {
    SegmentRecord {
        name: name.to_owned(),
        size: 4096,
        address: 0x7f00_0000_0000,
        created_at: 1_700_000_000,
        pid: 42,
        fd: 7,
    }
}

#[test]
fn publish_then_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().join("nested"));

    assert!(registry.lookup("stats").unwrap().is_none());
    let path = registry.publish(&sample("stats")).unwrap();
    assert_eq!(path, registry.record_path("stats"));
    assert_eq!(registry.lookup("stats").unwrap(), Some(sample("stats")));
}

#[test]
fn publish_does_not_clobber() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path());

    registry.publish(&sample("stats")).unwrap();
    let mut other = sample("stats");
    other.pid = 43;

    let err = registry.publish(&other).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    assert_eq!(registry.lookup("stats").unwrap(), Some(sample("stats")));
}

#[test]
fn record_uses_camel_case_fields() {
    let json = serde_json::to_value(sample("stats")).unwrap();
    assert_eq!(json["createdAt"], 1_700_000_000u64);
    assert_eq!(json["pid"], 42);
}

#[test]
fn malformed_record_is_invalid_data() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path());
    fs::write(registry.record_path("broken"), b"{\"name\":").unwrap();

    let err = registry.lookup("broken").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn retract_only_own_record() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path());
    registry.publish(&sample("stats")).unwrap();

    assert!(!registry.retract("stats", 42, 8).unwrap());
    assert!(registry.lookup("stats").unwrap().is_some());

    assert!(registry.retract("stats", 42, 7).unwrap());
    assert!(registry.lookup("stats").unwrap().is_none());
    assert!(!registry.retract("stats", 42, 7).unwrap());
}
