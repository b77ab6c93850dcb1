//! The allocation table stored at the start of every segment.
//!
//! The table is a UTF-8 JSON document, padded with NUL bytes to the fixed size of the header
//! region. JSON text never contains a raw NUL, so the first one ends the document.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Allocation, ALIGNMENT};

/// The layout version written by this crate. Other versions are refused, never guessed at.
pub const HEADER_VERSION: u32 = 1;

/// Bytes reserved for the table unless configured otherwise.
pub const DEFAULT_HEADER_SIZE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub version: u32,
    pub total_size: usize,
    pub allocation_count: usize,
    pub allocations: Vec<HeaderEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub offset: usize,
    pub size: usize,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    /// Nothing has been written to the header region yet.
    #[error("the header region is blank")]
    Blank,
    #[error("malformed header")]
    Malformed(#[source] serde_json::Error),
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u32),
    /// The table parses but contradicts itself or the segment.
    #[error("inconsistent header: {0}")]
    Inconsistent(String),
    #[error("the header needs {needed} bytes but only {capacity} are reserved")]
    Overflow { needed: usize, capacity: usize },
}

/// Only the field that decides how to read the rest.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl Header {
    pub fn empty(total_size: usize) -> Self {
        Header::from_table(total_size, std::iter::empty())
    }

    pub fn from_table<'lt>(
        total_size: usize,
        allocations: impl IntoIterator<Item = &'lt Allocation>,
    ) -> Self {
        let allocations: Vec<_> = allocations
            .into_iter()
            .map(|allocation| HeaderEntry {
                offset: allocation.offset,
                size: allocation.size,
                kind: allocation.kind.tag().to_owned(),
            })
            .collect();

        Header {
            version: HEADER_VERSION,
            total_size,
            allocation_count: allocations.len(),
            allocations,
        }
    }

    /// Serialize into exactly `capacity` bytes.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>, HeaderError> {
        let mut bytes = serde_json::to_vec(self).map_err(HeaderError::Malformed)?;

        if bytes.len() > capacity {
            return Err(HeaderError::Overflow {
                needed: bytes.len(),
                capacity,
            });
        }

        // Clears whatever a longer, previous table left behind.
        bytes.resize(capacity, 0);
        Ok(bytes)
    }

    pub fn decode(region: &[u8]) -> Result<Self, HeaderError> {
        let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
        let text = &region[..end];

        if text.iter().all(u8::is_ascii_whitespace) {
            return Err(HeaderError::Blank);
        }

        let VersionProbe { version } =
            serde_json::from_slice(text).map_err(HeaderError::Malformed)?;

        if version != HEADER_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        serde_json::from_slice(text).map_err(HeaderError::Malformed)
    }

    /// Check the table against the invariants of the arena.
    ///
    /// Every entry must be a non-empty, aligned range within `[header_size, total_size)` and no two
    /// entries may overlap.
    pub fn validate(&self, header_size: usize) -> Result<(), HeaderError> {
        if self.allocation_count != self.allocations.len() {
            return Err(inconsistent(format!(
                "counts {} allocations but lists {}",
                self.allocation_count,
                self.allocations.len()
            )));
        }

        if self.total_size < header_size {
            return Err(inconsistent(format!(
                "total size {} is smaller than the header",
                self.total_size
            )));
        }

        let mut ranges = Vec::with_capacity(self.allocations.len());
        for entry in &self.allocations {
            let end = entry.offset.checked_add(entry.size);

            if entry.size == 0 || entry.size % ALIGNMENT != 0 {
                return Err(inconsistent(format!(
                    "allocation at {} has unaligned size {}",
                    entry.offset, entry.size
                )));
            }

            match end {
                Some(end) if entry.offset >= header_size && end <= self.total_size => {
                    ranges.push(entry.offset..end)
                }
                _ => {
                    return Err(inconsistent(format!(
                        "allocation at {} of {} bytes is out of bounds",
                        entry.offset, entry.size
                    )))
                }
            }
        }

        ranges.sort_by_key(|range| range.start);
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(inconsistent(format!(
                    "allocations at {} and {} overlap",
                    pair[0].start, pair[1].start
                )));
            }
        }

        Ok(())
    }
}

fn inconsistent(msg: String) -> HeaderError {
    HeaderError::Inconsistent(msg)
}

#[cfg(test)]
fn entry(offset: usize, size: usize, kind: &str) -> HeaderEntry {
    HeaderEntry {
        offset,
        size,
        kind: kind.to_owned(),
    }
}

#[test]
fn wire_format_field_names() {
    let header = Header {
        version: HEADER_VERSION,
        total_size: 65536,
        allocation_count: 1,
        allocations: vec![entry(1024, 104, "stats")],
    };

    let text = String::from_utf8(header.encode(256).unwrap()).unwrap();
    let text = text.trim_end_matches('\0');
    assert_eq!(
        text,
        r#"{"version":1,"totalSize":65536,"allocationCount":1,"allocations":[{"offset":1024,"size":104,"type":"stats"}]}"#
    );
}

#[test]
fn decode_ignores_padding() {
    let header = Header::empty(4096);
    let encoded = header.encode(1024).unwrap();
    assert_eq!(encoded.len(), 1024);
    assert_eq!(Header::decode(&encoded).unwrap(), header);
}

#[test]
fn encode_overflow() {
    let header = Header::empty(4096);
    let err = header.encode(8).unwrap_err();
    assert!(matches!(err, HeaderError::Overflow { capacity: 8, needed } if needed > 8));
}

#[test]
fn blank_region() {
    assert!(matches!(Header::decode(&[0; 64]), Err(HeaderError::Blank)));
    assert!(matches!(Header::decode(&[]), Err(HeaderError::Blank)));
}

#[test]
fn unknown_version_is_refused() {
    let text = br#"{"version":2,"layout":"something else entirely"}"#;
    assert!(matches!(
        Header::decode(text),
        Err(HeaderError::UnsupportedVersion(2))
    ));
}

#[test]
fn garbage_is_malformed() {
    assert!(matches!(
        Header::decode(b"\x7fELF"),
        Err(HeaderError::Malformed(_))
    ));
}

#[test]
fn validate_rejects_inconsistent_tables() {
    let valid = Header {
        version: HEADER_VERSION,
        total_size: 4096,
        allocation_count: 2,
        allocations: vec![entry(1024, 8, "a"), entry(1032, 16, "b")],
    };
    assert!(valid.validate(1024).is_ok());

    let mut miscounted = valid.clone();
    miscounted.allocation_count = 3;

    let mut overlapping = valid.clone();
    overlapping.allocations[1].offset = 1028;

    let mut in_header = valid.clone();
    in_header.allocations[0].offset = 512;

    let mut past_end = valid.clone();
    past_end.allocations[1].size = 4096;

    let mut unaligned = valid.clone();
    unaligned.allocations[0].size = 7;

    let mut wrapping = valid.clone();
    wrapping.allocations[1].offset = usize::MAX - 7;

    for header in [miscounted, overlapping, in_header, past_end, unaligned, wrapping] {
        assert!(
            matches!(header.validate(1024), Err(HeaderError::Inconsistent(_))),
            "{header:?}"
        );
    }
}
