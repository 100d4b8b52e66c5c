//! Atomic bulk copy-in/copy-out of a container as a single archive (C4).
//!
//! The archive format is a plain `tar` stream. `unpack` does not assume the
//! descriptor is the first entry: it drains the whole archive, buffering the
//! descriptor bytes until they are found, and returns them once the stream
//! is exhausted — satisfying "the packer guarantees that the descriptor
//! bytes appear in the stream... even if they are not the first entry."

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{ContainerError, Result};

const DESCRIPTOR_ENTRY_NAME: &str = "descriptor";

/// Write the container's `metadata/` and `chunks/` directories, plus the
/// descriptor bytes under a well-known archive entry name, into `out`.
pub fn pack<W: Write>(
    metadata_dir: &Path,
    chunks_dir: &Path,
    descriptor_bytes: &[u8],
    out: W,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    if chunks_dir.exists() {
        builder
            .append_dir_all("chunks", chunks_dir)
            .map_err(|e| ContainerError::io(chunks_dir, e))?;
    }
    if metadata_dir.exists() {
        builder
            .append_dir_all("metadata", metadata_dir)
            .map_err(|e| ContainerError::io(metadata_dir, e))?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(descriptor_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, DESCRIPTOR_ENTRY_NAME, descriptor_bytes)
        .map_err(|e| ContainerError::io(Path::new(DESCRIPTOR_ENTRY_NAME), e))?;

    builder
        .into_inner()
        .map_err(|e| ContainerError::io(Path::new("<archive>"), e))?;
    Ok(())
}

/// Extract `metadata/` and `chunks/` into `dest_root`, returning the
/// descriptor bytes found in the stream.
pub fn unpack<R: Read>(dest_root: &Path, input: R) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(input);
    let mut descriptor_bytes: Option<Vec<u8>> = None;

    for entry in archive
        .entries()
        .map_err(|e| ContainerError::io(dest_root, e))?
    {
        let mut entry = entry.map_err(|e| ContainerError::io(dest_root, e))?;
        let path = entry
            .path()
            .map_err(|e| ContainerError::io(dest_root, e))?
            .into_owned();

        if path == Path::new(DESCRIPTOR_ENTRY_NAME) {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| ContainerError::io(dest_root, e))?;
            descriptor_bytes = Some(buf);
            continue;
        }

        entry
            .unpack_in(dest_root)
            .map_err(|e| ContainerError::io(dest_root, e))?;
    }

    descriptor_bytes.ok_or_else(|| {
        ContainerError::Internal(anyhow::anyhow!(
            "archive did not contain a descriptor entry"
        ))
    })
}
