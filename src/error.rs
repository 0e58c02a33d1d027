use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Failure to read, write or lock one of the JSON documents.
///
/// Whenever one of these is returned the document on disk is unchanged.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("lock {}: gave up after {waited:?}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            StorageError::Read { path, .. }
            | StorageError::Write { path, .. }
            | StorageError::Decode { path, .. }
            | StorageError::Encode { path, .. }
            | StorageError::LockTimeout { path, .. }
            | StorageError::Lock { path, .. } => path,
        }
    }
}
