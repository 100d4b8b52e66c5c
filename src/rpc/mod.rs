//! Replica pipeline client (C7): acquiring/releasing RPC clients for a
//! replica set and sending typed requests over them.

pub mod wire;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use wire::{DatanodeRequest, DatanodeResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationType {
    Standalone,
    Ratis,
}

/// Ordered set of datanode endpoints replicating a container (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub replication_type: ReplicationType,
    pub nodes: Vec<String>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, replication_type: ReplicationType, nodes: Vec<String>) -> Self {
        Pipeline {
            id: id.into(),
            replication_type,
            nodes,
        }
    }

    /// True if `self` and `other` share at least one datanode. Used by the
    /// block stream to decide whether a refreshed pipeline is actually a
    /// different replica set (§4.6 Pipeline refresh).
    pub fn overlaps(&self, other: &Pipeline) -> bool {
        self.nodes.iter().any(|n| other.nodes.contains(n))
    }

    /// The variant actually used for reads: reads always go over a
    /// synthesized standalone pipeline regardless of how the container is
    /// replicated, to avoid consensus coordination overhead (§4.7).
    pub fn as_read_pipeline(&self) -> Pipeline {
        Pipeline {
            id: self.id.clone(),
            replication_type: ReplicationType::Standalone,
            nodes: self.nodes.clone(),
        }
    }
}

/// Client for a replica pipeline: acquire/release a handle, send typed
/// requests over it.
pub trait ReplicaPipelineClient: Send + Sync {
    type Handle: Send;

    fn acquire_read_client(&self, pipeline: &Pipeline) -> Result<Self::Handle>;
    fn release_read_client(&self, handle: Self::Handle, invalidate: bool);
    fn send_blocking(
        &self,
        handle: &Self::Handle,
        request: DatanodeRequest,
    ) -> Result<DatanodeResponse>;
}
