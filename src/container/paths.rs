//! Pure functions computing the on-disk layout of a container (C2).
//!
//! ```text
//! <volumeRoot>/<clusterOrScmId>/<containerId>/
//!   metadata/
//!     <containerId>.container            descriptor
//!     <containerId>-dn-container.db/     embedded store
//!   chunks/
//!     <block-id>_chunk_<n>               opaque chunk files
//! ```

use std::path::{Path, PathBuf};

/// Root directory of one container: `<volumeRoot>/<clusterOrScmId>/<containerId>`.
pub fn container_root(volume_root: &Path, id_subdir: &str, container_id: u64) -> PathBuf {
    volume_root.join(id_subdir).join(container_id.to_string())
}

pub fn metadata_dir(volume_root: &Path, id_subdir: &str, container_id: u64) -> PathBuf {
    container_root(volume_root, id_subdir, container_id).join("metadata")
}

pub fn chunks_dir(volume_root: &Path, id_subdir: &str, container_id: u64) -> PathBuf {
    container_root(volume_root, id_subdir, container_id).join("chunks")
}

pub fn descriptor_file(volume_root: &Path, id_subdir: &str, container_id: u64) -> PathBuf {
    metadata_dir(volume_root, id_subdir, container_id).join(format!("{}.container", container_id))
}

pub fn embedded_store_dir(volume_root: &Path, id_subdir: &str, container_id: u64) -> PathBuf {
    metadata_dir(volume_root, id_subdir, container_id)
        .join(format!("{}-dn-container.db", container_id))
}

/// Name of the chunk file for the given block id and chunk index within the
/// `chunks/` directory.
pub fn chunk_file_name(block_id: u64, chunk_index: usize) -> String {
    format!("{}_chunk_{}", block_id, chunk_index)
}

pub fn chunk_file(
    volume_root: &Path,
    id_subdir: &str,
    container_id: u64,
    block_id: u64,
    chunk_index: usize,
) -> PathBuf {
    chunks_dir(volume_root, id_subdir, container_id).join(chunk_file_name(block_id, chunk_index))
}
