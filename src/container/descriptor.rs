//! The container descriptor: a self-checksummed, line-oriented text
//! document capturing every persisted container attribute (§3, §6).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use nix::unistd;

use crate::checksum::crc32c_of;
use crate::container::state::ContainerState;
use crate::error::{ContainerError, Result};

/// Schema version of the descriptor format itself (distinct from the
/// container's own `schema_version` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "1",
            SchemaVersion::V2 => "2",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "1" => Some(SchemaVersion::V1),
            "2" => Some(SchemaVersion::V2),
            _ => None,
        }
    }
}

/// All persisted attributes of a container (§3, §6).
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
    pub container_id: u64,
    pub container_type: String,
    pub state: ContainerState,
    pub schema_version: SchemaVersion,
    pub layout_version: u32,
    pub max_size: u64,
    pub bytes_used: u64,
    pub key_count: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub block_commit_sequence_id: u64,
    pub delete_transaction_id: u64,
    pub origin_node_id: String,
    pub origin_pipeline_id: String,
    pub last_data_scan_timestamp: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    /// Populated on serialize/verified on load; `None` until first computed.
    pub checksum_of_content: u64,
}

impl ContainerDescriptor {
    pub fn new(container_id: u64, max_size: u64, origin_node_id: impl Into<String>) -> Self {
        ContainerDescriptor {
            container_id,
            container_type: "KeyValueContainer".to_string(),
            state: ContainerState::Open,
            schema_version: SchemaVersion::V2,
            layout_version: 1,
            max_size,
            bytes_used: 0,
            key_count: 0,
            read_count: 0,
            write_count: 0,
            read_bytes: 0,
            write_bytes: 0,
            block_commit_sequence_id: 0,
            delete_transaction_id: 0,
            origin_node_id: origin_node_id.into(),
            origin_pipeline_id: String::new(),
            last_data_scan_timestamp: None,
            metadata: BTreeMap::new(),
            checksum_of_content: 0,
        }
    }

    /// Serialize to the on-disk line format, with `checksumOfContent` zeroed
    /// so the caller can compute the checksum over this exact text.
    fn serialize_with_checksum(&self, checksum: u64) -> String {
        let mut out = String::new();
        macro_rules! line {
            ($k:expr, $v:expr) => {
                out.push_str(&format!("{}: {}\n", $k, $v))
            };
        }
        line!("containerID", self.container_id);
        line!("containerType", self.container_type);
        line!("state", self.state.as_str());
        line!("schemaVersion", self.schema_version.as_str());
        line!("layoutVersion", self.layout_version);
        line!("maxSize", self.max_size);
        line!("bytesUsed", self.bytes_used);
        line!("keyCount", self.key_count);
        line!("readCount", self.read_count);
        line!("writeCount", self.write_count);
        line!("readBytes", self.read_bytes);
        line!("writeBytes", self.write_bytes);
        line!("blockCommitSequenceId", self.block_commit_sequence_id);
        line!("deleteTransactionId", self.delete_transaction_id);
        line!("originNodeId", self.origin_node_id);
        line!("originPipelineId", self.origin_pipeline_id);
        if let Some(ts) = self.last_data_scan_timestamp {
            line!("lastDataScanTimestamp", ts);
        }
        for (k, v) in &self.metadata {
            out.push_str(&format!("metadata.{}: {}\n", k, v));
        }
        line!("checksumOfContent", checksum);
        out
    }

    fn compute_checksum(&self) -> u64 {
        let text = self.serialize_with_checksum(0);
        crc32c_of(text.as_bytes()) as u64
    }

    /// Serialize, computing and embedding the content checksum.
    pub fn serialize(&mut self) -> String {
        let checksum = self.compute_checksum();
        self.checksum_of_content = checksum;
        self.serialize_with_checksum(checksum)
    }

    /// Parse the on-disk text form. Does not validate the checksum — callers
    /// use [`Self::verify_checksum`] so that a mismatch can be turned into
    /// "mark container UNHEALTHY" rather than a load failure (§4.2).
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut fields = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("malformed descriptor line: {:?}", line))?;
            let key = key.trim();
            let value = value.trim();
            if let Some(meta_key) = key.strip_prefix("metadata.") {
                metadata.insert(meta_key.to_string(), value.to_string());
            } else {
                fields.insert(key.to_string(), value.to_string());
            }
        }

        macro_rules! req {
            ($k:expr) => {
                fields
                    .get($k)
                    .ok_or_else(|| anyhow::anyhow!("missing descriptor field {:?}", $k))?
            };
        }
        macro_rules! parse_req {
            ($k:expr) => {
                req!($k)
                    .parse()
                    .map_err(|e| anyhow::anyhow!("bad value for {:?}: {}", $k, e))?
            };
        }

        Ok(ContainerDescriptor {
            container_id: parse_req!("containerID"),
            container_type: req!("containerType").clone(),
            state: ContainerState::parse(req!("state"))
                .ok_or_else(|| anyhow::anyhow!("unknown state {:?}", req!("state")))?,
            schema_version: SchemaVersion::parse(req!("schemaVersion"))
                .ok_or_else(|| anyhow::anyhow!("unknown schemaVersion"))?,
            layout_version: parse_req!("layoutVersion"),
            max_size: parse_req!("maxSize"),
            bytes_used: parse_req!("bytesUsed"),
            key_count: parse_req!("keyCount"),
            read_count: parse_req!("readCount"),
            write_count: parse_req!("writeCount"),
            read_bytes: parse_req!("readBytes"),
            write_bytes: parse_req!("writeBytes"),
            block_commit_sequence_id: parse_req!("blockCommitSequenceId"),
            delete_transaction_id: parse_req!("deleteTransactionId"),
            origin_node_id: req!("originNodeId").clone(),
            origin_pipeline_id: req!("originPipelineId").clone(),
            last_data_scan_timestamp: fields
                .get("lastDataScanTimestamp")
                .map(|v| v.parse())
                .transpose()?,
            metadata,
            checksum_of_content: parse_req!("checksumOfContent"),
        })
    }

    /// True if the embedded checksum matches a fresh recomputation.
    pub fn verify_checksum(&self) -> bool {
        self.checksum_of_content == self.compute_checksum()
    }
}

/// Write-to-temp-then-rename, same directory as `path` for same-filesystem
/// atomicity (§4.2). On any failure the temp file is removed and the target
/// is left untouched.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("descriptor path has no parent: {:?}", path))?;
    std::fs::create_dir_all(dir).map_err(|e| ContainerError::io(dir, e))?;

    let mut template = dir.join(format!(
        "{}.tmp_XXXXXX",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("descriptor")
    ));
    // mkstemp needs a path it can mutate the trailing X's of.
    let (fd, tmp_path) = unistd::mkstemp(&template).map_err(|e| {
        ContainerError::io(
            template.clone(),
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?;
    template = tmp_path;

    let write_result = (|| -> std::io::Result<()> {
        use std::os::unix::io::FromRawFd;
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        file.write_all(data)?;
        file.sync_all()
    })();

    if let Err(err) = write_result {
        let _ = unistd::unlink(&template);
        return Err(ContainerError::io(template, err));
    }

    if let Err(err) = std::fs::rename(&template, path) {
        let _ = unistd::unlink(&template);
        return Err(ContainerError::io(path, err));
    }

    Ok(())
}

pub fn load_descriptor(path: &Path) -> anyhow::Result<ContainerDescriptor> {
    let text = std::fs::read_to_string(path)?;
    ContainerDescriptor::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let mut d = ContainerDescriptor::new(1, 1 << 30, "node-a");
        d.metadata.insert("owner".into(), "alice".into());
        let text = d.serialize();
        let parsed = ContainerDescriptor::parse(&text).unwrap();
        assert!(parsed.verify_checksum());
        assert_eq!(parsed.container_id, 1);
        assert_eq!(parsed.metadata.get("owner").unwrap(), "alice");
    }

    #[test]
    fn tampering_breaks_checksum() {
        let mut d = ContainerDescriptor::new(2, 100, "node-a");
        let text = d.serialize();
        let tampered = text.replace("bytesUsed: 0", "bytesUsed: 999999");
        let parsed = ContainerDescriptor::parse(&tampered).unwrap();
        assert!(!parsed.verify_checksum());
    }

    #[test]
    fn atomic_write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5.container");
        let mut d = ContainerDescriptor::new(5, 100, "node-a");
        let text = d.serialize();
        write_atomic(&path, text.as_bytes()).unwrap();
        assert!(path.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
