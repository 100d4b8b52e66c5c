//! Datanode-side key/value container engine and client-side block read
//! path: on-disk container lifecycle (create/close/quasi-close/delete),
//! crash-safe descriptor persistence, an embedded per-container key/value
//! store, container import/export for replication bootstrap, and the
//! chunked, checksum-verifying, retrying block read stream used by
//! clients.

pub mod cancel;
pub mod checksum;
pub mod container;
pub mod error;
pub mod retry;
pub mod rpc;
pub mod stream;
pub mod volume;

pub use error::{ContainerError, Result};
