//! Error types for Shardcache

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Cache Errors
    #[error("value for the key {0} not found")]
    KeyNotFound(String),

    // Snapshot Errors
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    // Validation Errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal Errors
    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::KeyNotFound(_) => "KeyNotFound",
            Error::CorruptSnapshot(_) => "CorruptSnapshot",
            Error::SnapshotNotFound(_) => "NotFound",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InternalError(_) => "InternalError",
            Error::Io(_) => "InternalError",
            Error::Other(_) => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,

            Error::KeyNotFound(_) => 404,

            _ => 500,
        }
    }

    /// Whether a persistence read failure should be treated as "start empty"
    pub fn is_missing_or_corrupt_snapshot(&self) -> bool {
        matches!(self, Error::SnapshotNotFound(_) | Error::CorruptSnapshot(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_found_maps_to_404() {
        let err = Error::KeyNotFound("foo".to_string());
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.code(), "KeyNotFound");
        assert_eq!(err.to_string(), "value for the key foo not found");
    }

    #[test]
    fn test_snapshot_errors_are_recoverable() {
        assert!(Error::SnapshotNotFound("/tmp/x".into()).is_missing_or_corrupt_snapshot());
        assert!(Error::CorruptSnapshot("eof".into()).is_missing_or_corrupt_snapshot());
        assert!(!Error::InternalError("boom".into()).is_missing_or_corrupt_snapshot());
        assert_eq!(Error::CorruptSnapshot("eof".into()).http_status(), 500);
    }
}
