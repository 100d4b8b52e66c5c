//! Wire schema (C8): the request/response shapes exchanged at this crate's
//! two network boundaries — client ↔ namespace manager, and client ↔
//! datanode. Both are modeled as plain `serde`-derived Rust types rather
//! than generated protobuf bindings: this crate only needs to honor the
//! message *shapes* at its boundary (the namespace manager's own
//! implementation, and the protobuf codec itself, are external
//! collaborators, §1).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Client <-> datanode
// ---------------------------------------------------------------------

/// A block identifier scoped to one container (§3 Block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatanodeBlockId {
    pub container_id: u64,
    pub local_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Crc32c,
    /// Representable on the wire; verification against it always fails
    /// with a checksum mismatch since only CRC-32C decoding is implemented.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    pub bytes_per_checksum: u32,
    pub checksums: Vec<u32>,
}

impl ChecksumSpec {
    /// Which checksum-boundary segment (§4.5) a byte offset within the
    /// chunk falls into.
    pub fn segment_for_offset(&self, offset: u64) -> usize {
        (offset / self.bytes_per_checksum as u64) as usize
    }
}

/// An immutable sub-range of a block (§3 Chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub name: String,
    pub offset: u64,
    pub length: u64,
    pub checksum: ChecksumSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub chunks: Vec<ChunkInfo>,
}

impl BlockData {
    pub fn declared_length(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlockRequest {
    pub block_id: DatanodeBlockId,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadChunkRequest {
    pub block_id: DatanodeBlockId,
    pub chunk_info: ChunkInfo,
    pub read_offset: Option<u64>,
    pub read_length: Option<u64>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DatanodeRequest {
    GetBlock(GetBlockRequest),
    ReadChunk(ReadChunkRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DatanodeResponse {
    Block(BlockData),
    Chunk(Vec<u8>),
}

// ---------------------------------------------------------------------
// Client <-> namespace manager
// ---------------------------------------------------------------------

/// Enumerated command tag, one per namespace-manager RPC. The real
/// protocol carries roughly sixty of these across Volume/Bucket/Key/
/// Multipart/File/Acl/Prepare/Upgrade/Service-list/DB-updates/
/// Delegation-token/S3-secret/Trash families; this lists the ones this
/// crate's boundary actually references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdType {
    CreateVolume,
    SetVolumeProperty,
    CheckVolumeAccess,
    CreateBucket,
    InfoBucket,
    SetBucketProperty,
    CreateKey,
    LookupKey,
    CommitKey,
    DeleteKey,
    InitiateMultiPartUpload,
    CommitMultiPartUpload,
    AbortMultiPartUpload,
    GetAcl,
    AddAcl,
    GetDelegationToken,
    RenewDelegationToken,
    CancelDelegationToken,
    GetS3Secret,
    ServiceList,
    DBUpdates,
}

/// Status code on a response envelope. Representative subset of the real
/// protocol's ~60 error codes plus `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    VolumeNotFound,
    VolumeAlreadyExists,
    BucketNotFound,
    BucketAlreadyExists,
    KeyNotFound,
    KeyAlreadyExists,
    InvalidToken,
    TokenExpired,
    PermissionDenied,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Authentication {
    pub access_id: String,
    pub signature: String,
    pub string_to_sign: String,
}

/// Request envelope (§6). `payload` carries exactly the variant matching
/// `cmd_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsmRequest {
    pub cmd_type: CmdType,
    pub trace_id: Option<String>,
    pub client_id: String,
    pub user_info: Option<UserInfo>,
    pub version: Option<u32>,
    pub layout_version: Option<u32>,
    pub s3_auth: Option<S3Authentication>,
    pub payload: serde_json::Value,
}

/// Response envelope (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsmResponse {
    pub cmd_type: CmdType,
    pub trace_id: Option<String>,
    pub success: bool,
    pub message: Option<String>,
    pub status: Status,
    pub leader_node_id: Option<String>,
    pub payload: serde_json::Value,
}
