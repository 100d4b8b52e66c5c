//! Reference-counted embedded key/value store handles (Design Note
//! "Reference-counted embedded store handle").
//!
//! The embedded store lives at `<containerId>-dn-container.db` and backs a
//! container's block metadata. Multiple callers within the same process may
//! want a handle to the same container's store concurrently (reads, a
//! writer, export); we hand out clones of one cached `sled::Db` per
//! container id and only drop it from the cache when the last handle goes
//! away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ContainerError, Result};

struct CacheEntry {
    db: sled::Db,
    refcount: usize,
}

/// Process-wide cache of open embedded stores, keyed by container id.
#[derive(Default)]
pub struct StoreCache {
    entries: Mutex<HashMap<u64, CacheEntry>>,
    /// Container ids currently excluded from new handles, e.g. mid-export.
    excluded: Mutex<std::collections::HashSet<u64>>,
}

/// A held reference to a container's embedded store; dropping it releases
/// the reference and may evict the underlying `sled::Db` from the cache.
pub struct StoreHandle {
    container_id: u64,
    db: sled::Db,
    cache: Arc<StoreCache>,
}

impl StoreHandle {
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Flush the store's write-ahead log to disk. Maps to "flush and fsync"
    /// in §4.3/§4.6.
    pub fn flush_and_sync(&self) -> Result<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| ContainerError::DbSyncError {
                container_id: self.container_id,
                source: anyhow::Error::from(e),
            })
    }

    /// Compact the store ahead of packing it for export.
    pub fn compact(&self) -> Result<()> {
        // sled does not expose a blocking manual-compaction call; a flush is
        // the closest crash-consistent equivalent and is what export needs
        // before it stops handing out new handles.
        self.flush_and_sync()
            .map_err(|e| match e {
                ContainerError::DbSyncError { container_id, source } => {
                    ContainerError::DbCompactError { container_id, source }
                }
                other => other,
            })
    }

    /// Number of persisted keys, used to rebuild in-memory counters after
    /// import (§4.3 Import).
    pub fn key_count(&self) -> u64 {
        self.db.len() as u64
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        let mut entries = self.cache.entries.lock();
        if let Some(entry) = entries.get_mut(&self.container_id) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(&self.container_id);
            }
        }
    }
}

impl StoreCache {
    pub fn new() -> Arc<Self> {
        Arc::new(StoreCache::default())
    }

    /// Acquire a handle to the container's embedded store, opening it if
    /// this is the first outstanding handle. Creation of the underlying
    /// `sled::Db` is serialized by the cache's mutex, so concurrent first
    /// acquisitions cannot race to open the same path twice.
    pub fn acquire(self: &Arc<Self>, container_id: u64, path: &Path) -> Result<StoreHandle> {
        if self.excluded.lock().contains(&container_id) {
            return Err(ContainerError::InvalidState {
                container_id,
                current: crate::container::state::ContainerState::Closed,
            });
        }

        let mut entries = self.entries.lock();
        let db = if let Some(entry) = entries.get_mut(&container_id) {
            entry.refcount += 1;
            entry.db.clone()
        } else {
            let db = sled::open(path)
                .map_err(|e| ContainerError::Internal(anyhow::Error::from(e)))?;
            entries.insert(
                container_id,
                CacheEntry {
                    db: db.clone(),
                    refcount: 1,
                },
            );
            db
        };

        Ok(StoreHandle {
            container_id,
            db,
            cache: Arc::clone(self),
        })
    }

    /// Remove the cache entry and refuse new handles for `container_id`
    /// until [`Self::end_exclusive`] is called. Export uses this to
    /// guarantee zero outstanding handles before packing (§5).
    pub fn begin_exclusive(&self, container_id: u64) {
        self.excluded.lock().insert(container_id);
        self.entries.lock().remove(&container_id);
    }

    pub fn end_exclusive(&self, container_id: u64) {
        self.excluded.lock().remove(&container_id);
    }

    pub fn outstanding(&self, container_id: u64) -> usize {
        self.entries
            .lock()
            .get(&container_id)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

pub fn remove_store_files(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| ContainerError::io(PathBuf::from(path), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_counting_keeps_one_db_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-dn-container.db");
        let cache = StoreCache::new();

        let h1 = cache.acquire(1, &path).unwrap();
        assert_eq!(cache.outstanding(1), 1);
        let h2 = cache.acquire(1, &path).unwrap();
        assert_eq!(cache.outstanding(1), 2);

        drop(h1);
        assert_eq!(cache.outstanding(1), 1);
        drop(h2);
        assert_eq!(cache.outstanding(1), 0);
    }

    #[test]
    fn exclusive_window_blocks_new_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2-dn-container.db");
        let cache = StoreCache::new();
        let handle = cache.acquire(2, &path).unwrap();
        drop(handle);

        cache.begin_exclusive(2);
        assert!(cache.acquire(2, &path).is_err());
        cache.end_exclusive(2);
        assert!(cache.acquire(2, &path).is_ok());
    }
}
