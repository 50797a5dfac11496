//! Error types for the lsmkv storage engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Corrupted file {path}: {reason}")]
    CorruptedFile { path: PathBuf, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tree is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn corrupted_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::CorruptedFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
