//! Typed errors for the container engine and block read path.

use std::path::PathBuf;

use thiserror::Error;

/// Every fallible operation in this crate resolves to one of these kinds.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container {container_id} already exists at {path:?}")]
    AlreadyExists { container_id: u64, path: PathBuf },

    #[error("container {container_id} is not open (current state {current:?})")]
    NotOpen {
        container_id: u64,
        current: crate::container::state::ContainerState,
    },

    #[error("operation not valid for container {container_id} in state {current:?}")]
    InvalidState {
        container_id: u64,
        current: crate::container::state::ContainerState,
    },

    #[error("unsupported request for container {container_id}: {reason}")]
    UnsupportedRequest { container_id: u64, reason: String },

    #[error("volume {volume:?} is out of space (need {needed} bytes, have {available} bytes)")]
    DiskOutOfSpace {
        volume: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("failed to write descriptor at {path:?}: {source}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("embedded store compaction failed for container {container_id}: {source}")]
    DbCompactError {
        container_id: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("embedded store sync failed for container {container_id}: {source}")]
    DbSyncError {
        container_id: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("seek/read past end of stream (pos {pos}, length {length})")]
    EndOfStream { pos: i64, length: u64 },

    #[error("checksum mismatch for chunk {chunk_name} at checksum index {index}")]
    ChecksumMismatch { chunk_name: String, index: usize },

    #[error("inconsistent chunk read: chunk {chunk_name} returned {got} bytes, expected {expected}")]
    InconsistentChunkRead {
        chunk_name: String,
        expected: usize,
        got: usize,
    },

    #[error("RPC transport failure talking to {endpoint}: {source}")]
    RpcTransport {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage-container error from {endpoint} ({code:?})")]
    StorageContainer {
        endpoint: String,
        code: StorageContainerCode,
    },

    #[error("security fault: {0}")]
    SecurityFault(String),

    #[error("operation {operation} cancelled while waiting for a lock")]
    Cancelled { operation: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Sub-codes carried by a storage-container-level failure, mirroring the
/// datanode's own distinction between a retriable hiccup and a fatal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageContainerCode {
    ContainerNotFound,
    ContainerUnhealthy,
    ClosedContainerIoException,
    NotRetriable,
}

impl ContainerError {
    /// Whether the retry policy (§4.8) is even allowed to consider retrying
    /// this error. `SecurityFault` and a `NOT_RETRIABLE` storage-container
    /// error never retry, no matter the policy's budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            ContainerError::SecurityFault(_) => false,
            ContainerError::StorageContainer { code, .. } => {
                !matches!(code, StorageContainerCode::NotRetriable)
            }
            ContainerError::RpcTransport { .. } => true,
            _ => false,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ContainerError::FileWriteError {
            path: path.into(),
            source,
        }
    }
}

impl From<std::io::Error> for ContainerError {
    fn from(source: std::io::Error) -> Self {
        ContainerError::Internal(anyhow::Error::from(source))
    }
}

impl From<sled::Error> for ContainerError {
    fn from(source: sled::Error) -> Self {
        ContainerError::Internal(anyhow::Error::from(source))
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
