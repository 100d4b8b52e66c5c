//! Minimal volume abstraction (A2).
//!
//! Volume *selection policy* and the disk checker are external
//! collaborators (§1 Non-goals); this module only models the volume the
//! rest of the system has already chosen — its root path, a coarse
//! capacity/used bookkeeping pair, and the `onFailure` hook a failed
//! data-plane operation calls so the surrounding system can mark the
//! volume unhealthy (§7).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cancel::{self, CancelToken};
use crate::error::{ContainerError, Result};

pub struct Volume {
    root: PathBuf,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    unhealthy: AtomicBool,
}

impl Volume {
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Volume {
            root: root.into(),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.used_bytes.load(Ordering::SeqCst))
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    /// Reserve `bytes` against this volume's capacity, failing with
    /// `DiskOutOfSpace` if there isn't room.
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let available = self.available_bytes();
        if bytes > available {
            return Err(ContainerError::DiskOutOfSpace {
                volume: self.root.clone(),
                needed: bytes,
                available,
            });
        }
        self.used_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        self.used_bytes.fetch_sub(bytes.min(self.used_bytes.load(Ordering::SeqCst)), Ordering::SeqCst);
    }
}

/// Called on any data-plane failure tied to a volume, so the surrounding
/// system can mark it unhealthy (§7 Propagation).
pub fn on_failure(volume: &Volume) {
    log::warn!("marking volume {:?} unhealthy after a data-plane failure", volume.root());
    volume.unhealthy.store(true, Ordering::SeqCst);
}

/// The set of volumes a datanode owns. Container creation holds this set's
/// read lock while selecting a volume (§5).
#[derive(Default)]
pub struct VolumeSet {
    volumes: RwLock<Vec<Arc<Volume>>>,
}

impl VolumeSet {
    pub fn new(volumes: Vec<Arc<Volume>>) -> Self {
        VolumeSet {
            volumes: RwLock::new(volumes),
        }
    }

    /// Choose the first healthy volume with enough free space. Real
    /// placement/balancing policy is out of scope; this exists only so
    /// container creation has *a* volume to hand the container engine.
    pub fn select(&self, needed_bytes: u64) -> Result<Arc<Volume>> {
        let guard = self.volumes.read();
        guard
            .iter()
            .find(|v| !v.is_unhealthy() && v.available_bytes() >= needed_bytes)
            .cloned()
            .ok_or_else(|| ContainerError::DiskOutOfSpace {
                volume: PathBuf::from("<no eligible volume>"),
                needed: needed_bytes,
                available: guard.iter().map(|v| v.available_bytes()).max().unwrap_or(0),
            })
    }

    /// Same as [`Self::select`], but the read-lock wait aborts with
    /// `Cancelled` if `token` is set before the lock is acquired (§5
    /// Cancellation & timeouts).
    pub fn select_interruptible(&self, needed_bytes: u64, token: &CancelToken) -> Result<Arc<Volume>> {
        let guard = cancel::read_interruptible(&self.volumes, token, "volume_set.select")?;
        guard
            .iter()
            .find(|v| !v.is_unhealthy() && v.available_bytes() >= needed_bytes)
            .cloned()
            .ok_or_else(|| ContainerError::DiskOutOfSpace {
                volume: PathBuf::from("<no eligible volume>"),
                needed: needed_bytes,
                available: guard.iter().map(|v| v.available_bytes()).max().unwrap_or(0),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_volume_with_enough_space() {
        let small = Arc::new(Volume::new("/v1", 10));
        let big = Arc::new(Volume::new("/v2", 1 << 30));
        let set = VolumeSet::new(vec![small, big.clone()]);
        let chosen = set.select(1 << 20).unwrap();
        assert_eq!(chosen.root(), big.root());
    }

    #[test]
    fn unhealthy_volumes_are_skipped() {
        let v = Arc::new(Volume::new("/v1", 1 << 30));
        on_failure(&v);
        let set = VolumeSet::new(vec![v]);
        assert!(set.select(1).is_err());
    }

    #[test]
    fn select_interruptible_succeeds_when_uncontended() {
        let big = Arc::new(Volume::new("/v2", 1 << 30));
        let set = VolumeSet::new(vec![big.clone()]);
        let token = CancelToken::new();
        let chosen = set.select_interruptible(1 << 20, &token).unwrap();
        assert_eq!(chosen.root(), big.root());
    }

    #[test]
    fn reserve_fails_when_over_capacity() {
        let v = Volume::new("/v1", 100);
        assert!(v.reserve(50).is_ok());
        assert!(v.reserve(60).is_err());
        assert_eq!(v.available_bytes(), 50);
    }
}
