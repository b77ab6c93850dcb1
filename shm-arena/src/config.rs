//! Configure an arena from the environment.
//!
//! The creator and every opener must agree on the name of the segment and the directory its
//! record lives in. Passing both through the environment lets a host hand an arena to the
//! processes it starts.
use std::ffi::OsString;
use std::path::PathBuf;

use shm_segment::{SegmentOptions, REGISTRY_ENV};
use thiserror::Error;

use crate::DEFAULT_HEADER_SIZE;

pub const NAME_ENV: &str = "SHM_ARENA_NAME";
pub const SIZE_ENV: &str = "SHM_ARENA_SIZE";
pub const HEADER_SIZE_ENV: &str = "SHM_ARENA_HEADER_SIZE";

pub const DEFAULT_NAME: &str = "shm-arena";
/// 128 MiB.
pub const DEFAULT_SIZE: usize = 128 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaOptions {
    pub name: String,
    /// Size of the whole segment, header included.
    pub size: usize,
    /// Bytes reserved at the start of the segment for the allocation table.
    pub header_size: usize,
    /// Directory for the discovery records of segments.
    pub registry: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("`{var}` is not valid unicode")]
    NotUnicode { var: &'static str },
    #[error("`{var}` is not a byte size")]
    BadSize {
        var: &'static str,
        #[source]
        source: ParseSizeError,
    },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("expected a number of bytes with an optional K, M or G suffix, found {0:?}")]
pub struct ParseSizeError(String);

impl ArenaOptions {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        ArenaOptions {
            name: name.into(),
            size,
            header_size: DEFAULT_HEADER_SIZE,
            registry: shm_segment::default_dir(),
        }
    }

    /// Read the options from `SHM_ARENA_*` variables, with defaults for those that are unset.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_vars(|var| std::env::var_os(var))
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Result<Self, EnvError> {
        let mut options = ArenaOptions::new(DEFAULT_NAME, DEFAULT_SIZE);

        if let Some(name) = var(NAME_ENV) {
            let Ok(name) = name.into_string() else {
                return Err(EnvError::NotUnicode { var: NAME_ENV });
            };

            options.name = name;
        }

        if let Some(size) = size_var(&var, SIZE_ENV)? {
            options.size = size;
        }

        if let Some(size) = size_var(&var, HEADER_SIZE_ENV)? {
            options.header_size = size;
        }

        if let Some(dir) = var(REGISTRY_ENV) {
            options.registry = PathBuf::from(dir);
        }

        Ok(options)
    }

    pub fn segment(&self) -> SegmentOptions {
        SegmentOptions {
            name: self.name.clone(),
            size: self.size,
            registry: self.registry.clone(),
        }
    }

    /// The variables under which an opener finds this arena again.
    pub fn to_vars(&self) -> Vec<(&'static str, OsString)> {
        Vec::from([
            (NAME_ENV, OsString::from(&self.name)),
            (SIZE_ENV, OsString::from(self.size.to_string())),
            (HEADER_SIZE_ENV, OsString::from(self.header_size.to_string())),
            (REGISTRY_ENV, self.registry.clone().into_os_string()),
        ])
    }
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions::new(DEFAULT_NAME, DEFAULT_SIZE)
    }
}

fn size_var(
    var: &impl Fn(&str) -> Option<OsString>,
    name: &'static str,
) -> Result<Option<usize>, EnvError> {
    let Some(value) = var(name) else {
        return Ok(None);
    };

    let Some(value) = value.to_str() else {
        return Err(EnvError::NotUnicode { var: name });
    };

    parse_size(value)
        .map(Some)
        .map_err(|source| EnvError::BadSize { var: name, source })
}

/// Parse a byte count such as `65536`, `64K` or `128M`. Suffixes are powers of 1024.
pub fn parse_size(text: &str) -> Result<usize, ParseSizeError> {
    let bad = || ParseSizeError(text.to_owned());
    let trimmed = text.trim();

    let (digits, shift) = match trimmed.char_indices().last() {
        Some((idx, 'k' | 'K')) => (&trimmed[..idx], 10),
        Some((idx, 'm' | 'M')) => (&trimmed[..idx], 20),
        Some((idx, 'g' | 'G')) => (&trimmed[..idx], 30),
        _ => (trimmed, 0),
    };

    let count: usize = digits.parse().map_err(|_| bad())?;
    count.checked_mul(1 << shift).ok_or_else(bad)
}

#[test]
fn sizes() {
    assert_eq!(parse_size("65536"), Ok(65536));
    assert_eq!(parse_size("64K"), Ok(64 << 10));
    assert_eq!(parse_size(" 128m "), Ok(128 << 20));
    assert_eq!(parse_size("1G"), Ok(1 << 30));
    assert!(parse_size("").is_err());
    assert!(parse_size("K").is_err());
    assert!(parse_size("-1").is_err());
    assert!(parse_size("12 MiB").is_err());
}

#[test]
fn defaults_without_vars() {
    let options = ArenaOptions::from_vars(|_| None).unwrap();
    assert_eq!(options.name, DEFAULT_NAME);
    assert_eq!(options.size, DEFAULT_SIZE);
    assert_eq!(options.header_size, DEFAULT_HEADER_SIZE);
}

#[test]
fn vars_round_trip() {
    let mut options = ArenaOptions::new("sysinfo", 1 << 16);
    options.header_size = 2048;
    options.registry = PathBuf::from("/run/user/1000/arenas");

    let vars = options.to_vars();
    let lookup = |name: &str| {
        vars.iter()
            .find(|(var, _)| *var == name)
            .map(|(_, value)| value.clone())
    };

    assert_eq!(ArenaOptions::from_vars(lookup), Ok(options));
}

#[test]
fn bad_size_var() {
    let err = ArenaOptions::from_vars(|name| {
        (name == SIZE_ENV).then(|| OsString::from("lots"))
    })
    .unwrap_err();

    assert!(matches!(err, EnvError::BadSize { var: SIZE_ENV, .. }));
}
