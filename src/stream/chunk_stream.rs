//! Lazy reader for one chunk (C5): connect on first read, verify checksum,
//! seek, unbuffer, close.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::checksum::crc32c_of;
use crate::error::{ContainerError, Result};
use crate::rpc::wire::{ChunkInfo, DatanodeBlockId, DatanodeRequest, DatanodeResponse, ReadChunkRequest};
use crate::rpc::{Pipeline, ReplicaPipelineClient};

/// One chunk's read session. Does not connect to a replica until the first
/// read (or an explicit [`Self::prepare`]) — so a seek past this chunk
/// never opens it.
pub struct ChunkReadStream<C: ReplicaPipelineClient> {
    chunk_info: ChunkInfo,
    block_id: DatanodeBlockId,
    current_pipeline: Arc<RwLock<Pipeline>>,
    client: Arc<C>,
    verify_checksum: bool,
    token: Option<String>,
    pos: u64,
    handle: Option<C::Handle>,
}

impl<C: ReplicaPipelineClient> ChunkReadStream<C> {
    pub fn new(
        chunk_info: ChunkInfo,
        block_id: DatanodeBlockId,
        current_pipeline: Arc<RwLock<Pipeline>>,
        client: Arc<C>,
        verify_checksum: bool,
        token: Option<String>,
    ) -> Self {
        ChunkReadStream {
            chunk_info,
            block_id,
            current_pipeline,
            client,
            verify_checksum,
            token,
            pos: 0,
            handle: None,
        }
    }

    pub fn chunk_length(&self) -> u64 {
        self.chunk_info.length
    }

    pub fn get_pos(&self) -> u64 {
        self.pos
    }

    pub fn get_remaining(&self) -> u64 {
        self.chunk_info.length.saturating_sub(self.pos)
    }

    /// Force the RPC client to be acquired now rather than on first read.
    pub fn prepare(&mut self) -> Result<()> {
        self.ensure_client()
    }

    fn ensure_client(&mut self) -> Result<()> {
        if self.handle.is_none() {
            let pipeline = self.current_pipeline.read().as_read_pipeline();
            let handle = self.client.acquire_read_client(&pipeline)?;
            self.handle = Some(handle);
        }
        Ok(())
    }

    /// Release the RPC client back to the pool without losing position.
    pub fn release_client(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.client.release_read_client(handle, false);
        }
    }

    /// Persist position and release the client so the connection can be
    /// pooled; a subsequent read transparently re-acquires.
    pub fn unbuffer(&mut self) {
        self.release_client();
    }

    pub fn close(&mut self) {
        self.release_client();
    }

    /// Seek within this chunk; a position at or past the chunk's length
    /// fails `EndOfStream`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset >= self.chunk_info.length {
            return Err(ContainerError::EndOfStream {
                pos: offset as i64,
                length: self.chunk_info.length,
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// Reset to the chunk's stored start (used when a block-level seek
    /// invalidates a previously-active chunk, §4.6).
    pub fn reset_to_start(&mut self) {
        self.pos = 0;
    }

    /// Read up to `buf.len()` bytes, stopping at chunk end. Returns `0` at
    /// end of chunk; otherwise the requested length is honored exactly — a
    /// reply short of what was asked for (but not yet at end of chunk) is
    /// `InconsistentChunkRead`, not a silent partial read (§4.5).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.chunk_info.length || buf.is_empty() {
            return Ok(0);
        }
        self.ensure_client()?;

        let want = buf.len().min((self.chunk_info.length - self.pos) as usize);
        let pipeline_id = self.current_pipeline.read().id.clone();
        let request = DatanodeRequest::ReadChunk(ReadChunkRequest {
            block_id: self.block_id,
            chunk_info: self.chunk_info.clone(),
            read_offset: Some(self.pos),
            read_length: Some(want as u64),
            token: self.token.clone(),
        });

        let handle = self.handle.as_ref().expect("ensure_client just set this");
        let response = self.client.send_blocking(handle, request).map_err(|e| {
            if let ContainerError::RpcTransport { source, .. } = e {
                ContainerError::RpcTransport {
                    endpoint: pipeline_id,
                    source,
                }
            } else {
                e
            }
        })?;

        let data = match response {
            DatanodeResponse::Chunk(bytes) => bytes,
            _ => {
                return Err(ContainerError::Internal(anyhow::anyhow!(
                    "expected a Chunk response from ReadChunk"
                )))
            }
        };

        if data.len() < want {
            return Err(ContainerError::InconsistentChunkRead {
                chunk_name: self.chunk_info.name.clone(),
                expected: want,
                got: data.len(),
            });
        }

        let n = want;
        buf[..n].copy_from_slice(&data[..n]);

        if self.verify_checksum {
            self.verify_checksum_boundaries(self.pos, &data[..n])?;
        }

        self.pos += n as u64;
        Ok(n)
    }

    /// Verify every checksum-boundary segment fully covered by `[start,
    /// start+data.len())` against the chunk's embedded checksum list.
    /// Partial leading/trailing segments (because the read didn't align to
    /// a boundary) cannot be verified in isolation and are skipped.
    fn verify_checksum_boundaries(&self, start: u64, data: &[u8]) -> Result<()> {
        let bpc = self.chunk_info.checksum.bytes_per_checksum as u64;
        if bpc == 0 {
            return Ok(());
        }
        let mut offset = start;
        let end = start + data.len() as u64;
        while offset < end {
            let boundary_start = (offset / bpc) * bpc;
            let boundary_end = boundary_start + bpc;
            if boundary_start >= start && boundary_end <= end {
                let segment_index = (boundary_start / bpc) as usize;
                let local_start = (boundary_start - start) as usize;
                let local_end = (boundary_end - start) as usize;
                let segment = &data[local_start..local_end];
                let actual = crc32c_of(segment);
                let expected = self
                    .chunk_info
                    .checksum
                    .checksums
                    .get(segment_index)
                    .copied()
                    .unwrap_or(0);
                if actual != expected {
                    return Err(ContainerError::ChecksumMismatch {
                        chunk_name: self.chunk_info.name.clone(),
                        index: segment_index,
                    });
                }
            }
            offset = boundary_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::wire::{ChecksumAlgorithm, ChecksumSpec};
    use crate::rpc::ReplicationType;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeClient {
        data: HashMap<String, Vec<u8>>,
        next_handle: Mutex<u64>,
        fail_next_acquire: std::sync::atomic::AtomicBool,
        short_reply_by: usize,
    }

    impl FakeClient {
        fn new(name: &str, bytes: Vec<u8>) -> Self {
            let mut data = HashMap::new();
            data.insert(name.to_string(), bytes);
            FakeClient {
                data,
                next_handle: Mutex::new(0),
                fail_next_acquire: std::sync::atomic::AtomicBool::new(false),
                short_reply_by: 0,
            }
        }

        /// A client whose `ReadChunk` replies are always `short_reply_by`
        /// bytes shorter than requested, short of end-of-chunk itself.
        fn new_short_replying(name: &str, bytes: Vec<u8>, short_reply_by: usize) -> Self {
            let mut data = HashMap::new();
            data.insert(name.to_string(), bytes);
            FakeClient {
                data,
                next_handle: Mutex::new(0),
                fail_next_acquire: std::sync::atomic::AtomicBool::new(false),
                short_reply_by,
            }
        }
    }

    impl ReplicaPipelineClient for FakeClient {
        type Handle = u64;

        fn acquire_read_client(&self, _pipeline: &Pipeline) -> Result<Self::Handle> {
            if self.fail_next_acquire.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ContainerError::RpcTransport {
                    endpoint: "dn".into(),
                    source: anyhow::anyhow!("connect refused"),
                });
            }
            let mut h = self.next_handle.lock();
            *h += 1;
            Ok(*h)
        }

        fn release_read_client(&self, _handle: Self::Handle, _invalidate: bool) {}

        fn send_blocking(
            &self,
            _handle: &Self::Handle,
            request: DatanodeRequest,
        ) -> Result<DatanodeResponse> {
            match request {
                DatanodeRequest::ReadChunk(r) => {
                    let full = self.data.get(&r.chunk_info.name).unwrap();
                    let off = r.read_offset.unwrap_or(0) as usize;
                    let len = r.read_length.unwrap_or(full.len() as u64) as usize;
                    let len = len.saturating_sub(self.short_reply_by);
                    let end = (off + len).min(full.len());
                    Ok(DatanodeResponse::Chunk(full[off..end].to_vec()))
                }
                _ => panic!("unexpected request"),
            }
        }
    }

    fn chunk_info(name: &str, length: u64, bytes_per_checksum: u32, checksums: Vec<u32>) -> ChunkInfo {
        ChunkInfo {
            name: name.to_string(),
            offset: 0,
            length,
            checksum: ChecksumSpec {
                algorithm: ChecksumAlgorithm::Crc32c,
                bytes_per_checksum,
                checksums,
            },
        }
    }

    fn pipeline() -> Arc<RwLock<Pipeline>> {
        Arc::new(RwLock::new(Pipeline::new(
            "p1",
            ReplicationType::Ratis,
            vec!["dn1".into()],
        )))
    }

    #[test]
    fn lazy_connect_until_first_read() {
        let data = b"0123456789".to_vec();
        let client = Arc::new(FakeClient::new("c0", data));
        let mut stream = ChunkReadStream::new(
            chunk_info("c0", 10, 16, vec![]),
            DatanodeBlockId { container_id: 1, local_id: 1 },
            pipeline(),
            client,
            false,
            None,
        );
        assert!(stream.handle.is_none());
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert!(stream.handle.is_some());
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let data = b"0123456789012345".to_vec(); // 16 bytes, one boundary
        let bad_checksum = crc32c_of(b"not the right bytes");
        let client = Arc::new(FakeClient::new("c1", data));
        let mut stream = ChunkReadStream::new(
            chunk_info("c1", 16, 16, vec![bad_checksum]),
            DatanodeBlockId { container_id: 1, local_id: 1 },
            pipeline(),
            client,
            true,
            None,
        );
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(err, ContainerError::ChecksumMismatch { .. }));
    }

    #[test]
    fn mid_chunk_short_reply_is_inconsistent_chunk_read() {
        // 20 bytes remaining in the chunk, caller asks for all 20, the
        // endpoint only hands back 5 — not end of chunk, so this must
        // surface as corruption rather than a quiet partial read.
        let data = b"01234567890123456789".to_vec();
        let client = Arc::new(FakeClient::new_short_replying("c4", data, 15));
        let mut stream = ChunkReadStream::new(
            chunk_info("c4", 20, 1024, vec![]),
            DatanodeBlockId { container_id: 1, local_id: 1 },
            pipeline(),
            client,
            false,
            None,
        );
        let mut buf = [0u8; 20];
        let err = stream.read(&mut buf).unwrap_err();
        match err {
            ContainerError::InconsistentChunkRead { expected, got, .. } => {
                assert_eq!(expected, 20);
                assert_eq!(got, 5);
            }
            other => panic!("expected InconsistentChunkRead, got {:?}", other),
        }
    }

    #[test]
    fn seek_past_end_fails() {
        let data = b"0123456789".to_vec();
        let client = Arc::new(FakeClient::new("c2", data));
        let mut stream = ChunkReadStream::new(
            chunk_info("c2", 10, 16, vec![]),
            DatanodeBlockId { container_id: 1, local_id: 1 },
            pipeline(),
            client,
            false,
            None,
        );
        assert!(stream.seek(10).is_err());
        assert!(stream.seek(9).is_ok());
    }

    #[test]
    fn unbuffer_then_read_resumes_at_saved_position() {
        let data = b"abcdefghij".to_vec();
        let client = Arc::new(FakeClient::new("c3", data));
        let mut stream = ChunkReadStream::new(
            chunk_info("c3", 10, 16, vec![]),
            DatanodeBlockId { container_id: 1, local_id: 1 },
            pipeline(),
            client,
            false,
            None,
        );
        let mut buf = [0u8; 3];
        stream.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        stream.unbuffer();
        assert!(stream.handle.is_none());
        let mut buf2 = [0u8; 1];
        stream.read(&mut buf2).unwrap();
        assert_eq!(&buf2, b"d");
    }
}
