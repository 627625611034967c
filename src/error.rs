use thiserror::Error;

/// Error kinds returned across the storage and runner API boundary.
///
/// These map onto the numeric codes in spec §6 via [`Error::code`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    Exists,
    #[error("read-set validation failed: a staged read is stale")]
    Conflict,
    #[error("writer slot is held by another transaction")]
    Busy,
    #[error("attempted a write operation on a read-only transaction")]
    Readonly,
    #[error("value or key exceeds the page or inline capacity")]
    Full,
    #[error("schema or wire-format data is invalid: {0}")]
    InvalidData(&'static str),
    #[error("a tree or free-list invariant was violated")]
    Corrupt,
    #[error("allocator ran out of space")]
    Oom,
    #[error("index or bound out of range")]
    Range,
    #[error("operation required data that was not present")]
    Empty,
    #[error("failed to parse a value")]
    Parse,
    #[error("value did not have the expected type")]
    Type,
    #[error("I/O error")]
    Io(#[source] std::io::Error),
    #[error("{0}")]
    Error(&'static str),
}

/// Numeric error codes exposed across the API boundary (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    NotFound = 1,
    Error = 2,
    Full = 3,
    Readonly = 4,
    Busy = 5,
    Exists = 6,
    Conflict = 7,
    InvalidData = 8,
    Oom = 9,
    Range = 10,
    Empty = 11,
    Corrupt = 12,
    Parse = 13,
    Type = 14,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound => ErrorCode::NotFound,
            Error::Exists => ErrorCode::Exists,
            Error::Conflict => ErrorCode::Conflict,
            Error::Busy => ErrorCode::Busy,
            Error::Readonly => ErrorCode::Readonly,
            Error::Full => ErrorCode::Full,
            Error::InvalidData(_) => ErrorCode::InvalidData,
            Error::Corrupt => ErrorCode::Corrupt,
            Error::Oom => ErrorCode::Oom,
            Error::Range => ErrorCode::Range,
            Error::Empty => ErrorCode::Empty,
            Error::Parse => ErrorCode::Parse,
            Error::Type => ErrorCode::Type,
            Error::Io(_) | Error::Error(_) => ErrorCode::Error,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode failure kinds for the wire codec (spec §4.G), distinct from the
/// domain [`Error`] set so callers can tell a malformed frame from a
/// domain-level failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("invalid field value")]
    Einval,
    #[error("destination buffer too small")]
    E2big,
    #[error("malformed frame: bad magic, field, or oversized length")]
    Eformat,
    #[error("unsupported wire version")]
    Eversion,
    #[error("frame truncated before its declared length")]
    Etrunc,
}
