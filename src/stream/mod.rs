//! Client-side block read path (C5, C6): a lazily-initialized stream over a
//! block's chunks, backed by a [`crate::rpc::ReplicaPipelineClient`].

pub mod block_stream;
pub mod chunk_stream;

pub use block_stream::{BlockReadStream, PipelineRefresher};
pub use chunk_stream::ChunkReadStream;
