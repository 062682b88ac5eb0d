//! Crate-wide error type.
//!
//! Mirrors the single-enum-with-`From`-impls style used throughout the
//! storage engine: callers match on [`Error`] variants directly rather than
//! downcasting through a boxed trait object.

use std::fmt::{self, Display};
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Index-corruption kinds. These never escape to a caller: on snapshot load
/// failure the engine falls back to rebuilding the keydir from data files.
#[derive(Debug)]
pub enum IndexCorruption {
    TruncatedKeySize,
    TruncatedKeyData,
    TruncatedItem,
    KeySizeTooLarge,
}

impl Display for IndexCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedKeySize => write!(f, "truncated key size in index snapshot"),
            Self::TruncatedKeyData => write!(f, "truncated key data in index snapshot"),
            Self::TruncatedItem => write!(f, "truncated item record in index snapshot"),
            Self::KeySizeTooLarge => write!(f, "key size in index snapshot exceeds max key size"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// `Get`/`Delete` of a key with no live entry.
    KeyNotFound,
    /// `Put`/`Delete` with a zero-length key.
    EmptyKey,
    /// `Put` with `key.len() > max_key_size`.
    KeyTooLarge,
    /// `Put` with `value.len() > max_value_size`.
    ValueTooLarge,
    /// Stored CRC-32 of a value did not match the recomputed checksum.
    ChecksumFailed,
    /// `Range(start, end, _)` with `start > end`.
    InvalidRange,
    /// The directory lock at `<path>/lock` is held by another process.
    DatabaseLocked,
    /// A mutating call on a database opened under `AutoReadonly`.
    DatabaseReadonly,
    /// A `Merge` call while another merge is already running.
    MergeInProgress,
    /// `Next`/`SeekPrefix` on a cursor already closed or exhausted.
    IteratorClosed,
    /// Forward/reverse cursor exhaustion; implicitly closes the cursor.
    StopIteration,
    /// A write on a datafile opened readonly.
    Readonly,
    /// `config.json` could not be read or parsed.
    BadConfig(String),
    /// `meta.json` could not be read or parsed.
    BadMetadata(String),
    /// A corrupt entry header: fewer than 12 prefix bytes available with at
    /// least one byte already consumed.
    ShortHeader,
    /// `key_size`/`value_size` violates the codec's bounds.
    InvalidSize,
    /// Key/value/checksum bytes could not be fully read after a valid
    /// header.
    Truncated,
    /// Index snapshot failed to parse; caller should rebuild from data
    /// files instead of surfacing this.
    Index(IndexCorruption),
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound => write!(f, "key not found"),
            Self::EmptyKey => write!(f, "key must not be empty"),
            Self::KeyTooLarge => write!(f, "key exceeds max key size"),
            Self::ValueTooLarge => write!(f, "value exceeds max value size"),
            Self::ChecksumFailed => write!(f, "checksum mismatch reading value"),
            Self::InvalidRange => write!(f, "range start is greater than range end"),
            Self::DatabaseLocked => write!(f, "database is locked by another process"),
            Self::DatabaseReadonly => write!(f, "database was opened readonly"),
            Self::MergeInProgress => write!(f, "a merge is already in progress"),
            Self::IteratorClosed => write!(f, "iterator is closed"),
            Self::StopIteration => write!(f, "iterator is exhausted"),
            Self::Readonly => write!(f, "data file is readonly"),
            Self::BadConfig(msg) => write!(f, "bad config: {msg}"),
            Self::BadMetadata(msg) => write!(f, "bad metadata: {msg}"),
            Self::ShortHeader => write!(f, "short entry header"),
            Self::InvalidSize => write!(f, "invalid key or value size in entry header"),
            Self::Truncated => write!(f, "truncated entry"),
            Self::Index(kind) => write!(f, "index corruption: {kind}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // A failed advisory lock acquisition surfaces as WouldBlock on most
        // platforms; translate it to the named variant instead of a bare
        // I/O error so callers can match on it directly.
        if err.kind() == io::ErrorKind::WouldBlock {
            return Error::DatabaseLocked;
        }
        Error::Io(err)
    }
}

impl From<IndexCorruption> for Error {
    fn from(kind: IndexCorruption) -> Self {
        Error::Index(kind)
    }
}
