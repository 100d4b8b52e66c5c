//! The key/value container: on-disk lifecycle (C2/C3), bulk import/export
//! (C4), and the embedded store handle a container owns.

pub mod descriptor;
pub mod packer;
pub mod paths;
pub mod state;
pub mod store;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cancel::{self, CancelToken};
use crate::error::{ContainerError, Result};
use crate::volume::Volume;
use descriptor::ContainerDescriptor;
use state::ContainerState;
use store::StoreCache;

struct Paths {
    container_root: PathBuf,
    metadata_dir: PathBuf,
    chunks_dir: PathBuf,
    descriptor_file: PathBuf,
    store_dir: PathBuf,
}

impl Paths {
    fn compute(volume_root: &std::path::Path, id_subdir: &str, container_id: u64) -> Self {
        Paths {
            container_root: paths::container_root(volume_root, id_subdir, container_id),
            metadata_dir: paths::metadata_dir(volume_root, id_subdir, container_id),
            chunks_dir: paths::chunks_dir(volume_root, id_subdir, container_id),
            descriptor_file: paths::descriptor_file(volume_root, id_subdir, container_id),
            store_dir: paths::embedded_store_dir(volume_root, id_subdir, container_id),
        }
    }
}

struct Inner {
    descriptor: ContainerDescriptor,
}

/// A single key/value container: its descriptor, its lock, and the path
/// layout it owns on one volume.
pub struct Container {
    container_id: u64,
    paths: Paths,
    volume: Arc<Volume>,
    store_cache: Arc<StoreCache>,
    inner: RwLock<Inner>,
}

impl Container {
    /// Create a brand-new container on `volume` (§4.3, data flow in §2).
    pub fn create(
        volume: Arc<Volume>,
        store_cache: Arc<StoreCache>,
        id_subdir: &str,
        container_id: u64,
        max_size: u64,
        origin_node_id: impl Into<String>,
    ) -> Result<Container> {
        let paths = Paths::compute(volume.root(), id_subdir, container_id);

        if paths.descriptor_file.exists() {
            return Err(ContainerError::AlreadyExists {
                container_id,
                path: paths.descriptor_file,
            });
        }

        volume.reserve(max_size)?;

        std::fs::create_dir_all(&paths.metadata_dir)
            .map_err(|e| ContainerError::io(paths.metadata_dir.clone(), e))?;
        std::fs::create_dir_all(&paths.chunks_dir)
            .map_err(|e| ContainerError::io(paths.chunks_dir.clone(), e))?;

        let mut descriptor = ContainerDescriptor::new(container_id, max_size, origin_node_id);
        let text = descriptor.serialize();
        if let Err(e) = descriptor::write_atomic(&paths.descriptor_file, text.as_bytes()) {
            let _ = std::fs::remove_dir_all(&paths.container_root);
            volume.release(max_size);
            return Err(e);
        }

        log::info!("created container {} on volume {:?}", container_id, volume.root());

        Ok(Container {
            container_id,
            paths,
            volume,
            store_cache,
            inner: RwLock::new(Inner { descriptor }),
        })
    }

    /// Load an existing container's descriptor from disk. A checksum
    /// mismatch marks the in-memory container UNHEALTHY rather than
    /// failing the load (§4.2).
    pub fn load(
        volume: Arc<Volume>,
        store_cache: Arc<StoreCache>,
        id_subdir: &str,
        container_id: u64,
    ) -> anyhow::Result<Container> {
        let paths = Paths::compute(volume.root(), id_subdir, container_id);
        let mut descriptor = descriptor::load_descriptor(&paths.descriptor_file)?;

        if !descriptor.verify_checksum() {
            log::error!(
                "container {} descriptor checksum mismatch at {:?}; marking UNHEALTHY",
                container_id,
                paths.descriptor_file
            );
            descriptor.state = ContainerState::Unhealthy;
        }

        Ok(Container {
            container_id,
            paths,
            volume,
            store_cache,
            inner: RwLock::new(Inner { descriptor }),
        })
    }

    pub fn container_id(&self) -> u64 {
        self.container_id
    }

    pub fn state(&self) -> ContainerState {
        self.inner.read().descriptor.state
    }

    pub fn descriptor_snapshot(&self) -> ContainerDescriptor {
        self.inner.read().descriptor.clone()
    }

    fn store_handle(&self) -> Result<store::StoreHandle> {
        self.store_cache.acquire(self.container_id, &self.paths.store_dir)
    }

    /// Flush and fsync the embedded store. Performed both outside and
    /// inside the write lock around close/quasi-close (§5).
    fn flush_store(&self) -> Result<()> {
        self.store_handle()?.flush_and_sync()
    }

    /// Apply one state-machine/metadata mutation under the write lock,
    /// rewriting the descriptor atomically and rolling back the in-memory
    /// change if the rewrite fails — unless the mutation left the container
    /// UNHEALTHY, in which case UNHEALTHY sticks (§4.3 step 4).
    fn apply_mutation(
        &self,
        precheck: impl FnOnce(&ContainerDescriptor) -> Result<()>,
        before_mutate: impl FnOnce() -> Result<()>,
        mutate: impl FnOnce(&mut ContainerDescriptor),
    ) -> Result<()> {
        let mut inner = self.inner.write();
        precheck(&inner.descriptor)?;
        before_mutate()?;

        let snapshot = inner.descriptor.clone();
        mutate(&mut inner.descriptor);
        let text = inner.descriptor.serialize();

        if let Err(e) = descriptor::write_atomic(&self.paths.descriptor_file, text.as_bytes()) {
            if inner.descriptor.state != ContainerState::Unhealthy {
                inner.descriptor = snapshot;
            } else {
                log::warn!(
                    "container {} left UNHEALTHY in memory after descriptor write failure",
                    self.container_id
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Same as [`Self::apply_mutation`], but the write-lock wait is
    /// interruptible via `token` (§5 Cancellation & timeouts).
    fn apply_mutation_interruptible(
        &self,
        token: &CancelToken,
        operation: &str,
        precheck: impl FnOnce(&ContainerDescriptor) -> Result<()>,
        before_mutate: impl FnOnce() -> Result<()>,
        mutate: impl FnOnce(&mut ContainerDescriptor),
    ) -> Result<()> {
        let mut inner = cancel::write_interruptible(&self.inner, token, operation)?;
        precheck(&inner.descriptor)?;
        before_mutate()?;

        let snapshot = inner.descriptor.clone();
        mutate(&mut inner.descriptor);
        let text = inner.descriptor.serialize();

        if let Err(e) = descriptor::write_atomic(&self.paths.descriptor_file, text.as_bytes()) {
            if inner.descriptor.state != ContainerState::Unhealthy {
                inner.descriptor = snapshot;
            } else {
                log::warn!(
                    "container {} left UNHEALTHY in memory after descriptor write failure",
                    self.container_id
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// `OPEN -> CLOSING`. Fails `NotOpen` from any other state.
    pub fn mark_for_close(&self) -> Result<()> {
        self.apply_mutation(
            |d| {
                if d.state.can_mark_for_close() {
                    Ok(())
                } else {
                    Err(ContainerError::NotOpen {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || Ok(()),
            |d| d.state = ContainerState::Closing,
        )
    }

    /// `OPEN|CLOSING -> CLOSED`. `close()` is also permitted directly from
    /// `OPEN`, short-circuiting `CLOSING`, mirroring the real datanode's
    /// close-without-quorum-certification path (see DESIGN.md).
    pub fn close(&self) -> Result<()> {
        self.flush_store()?;
        self.apply_mutation(
            |d| {
                if matches!(d.state, ContainerState::Open | ContainerState::Closing) {
                    Ok(())
                } else {
                    Err(ContainerError::NotOpen {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || self.flush_store(),
            |d| d.state = ContainerState::Closed,
        )
    }

    /// `CLOSING -> QUASI_CLOSED`, taken when a quorum-certified close isn't
    /// possible.
    pub fn quasi_close(&self) -> Result<()> {
        self.flush_store()?;
        self.apply_mutation(
            |d| {
                if d.state.can_close_or_quasi_close() {
                    Ok(())
                } else {
                    Err(ContainerError::NotOpen {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || self.flush_store(),
            |d| d.state = ContainerState::QuasiClosed,
        )
    }

    /// Any non-terminal state unconditionally transitions to `UNHEALTHY`.
    pub fn mark_unhealthy(&self) -> Result<()> {
        self.apply_mutation(
            |d| {
                if d.state.can_mark_unhealthy() {
                    Ok(())
                } else {
                    Err(ContainerError::InvalidState {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || Ok(()),
            |d| d.state = ContainerState::Unhealthy,
        )
    }

    /// Merge `updates` into the metadata map. Permitted in `OPEN` always;
    /// elsewhere only with `force`. The prior map is restored if the
    /// descriptor rewrite fails.
    pub fn update_metadata(&self, updates: BTreeMap<String, String>, force: bool) -> Result<()> {
        self.apply_mutation(
            |d| {
                if d.state.can_update_metadata(force) {
                    Ok(())
                } else {
                    Err(ContainerError::UnsupportedRequest {
                        container_id: self.container_id,
                        reason: "metadata update requires force outside OPEN".to_string(),
                    })
                }
            },
            || Ok(()),
            |d| d.metadata.extend(updates),
        )
    }

    /// Record a new block-commit-sequence id. Never decreases (§3).
    pub fn record_block_commit(&self, new_id: u64) -> Result<()> {
        self.apply_mutation(
            |d| {
                if new_id < d.block_commit_sequence_id {
                    Err(ContainerError::Internal(anyhow::anyhow!(
                        "block-commit-sequence-id must not decrease ({} -> {})",
                        d.block_commit_sequence_id,
                        new_id
                    )))
                } else {
                    Ok(())
                }
            },
            || Ok(()),
            |d| d.block_commit_sequence_id = new_id,
        )
    }

    /// `CLOSED|QUASI_CLOSED|UNHEALTHY -> DELETED`, then physically removes
    /// the container's directories.
    pub fn delete(&self) -> Result<()> {
        self.apply_mutation(
            |d| {
                if d.state.can_delete() {
                    Ok(())
                } else {
                    Err(ContainerError::InvalidState {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || Ok(()),
            |d| d.state = ContainerState::Deleted,
        )?;

        self.store_cache.begin_exclusive(self.container_id);
        store::remove_store_files(&self.paths.store_dir)?;
        if self.paths.chunks_dir.exists() {
            std::fs::remove_dir_all(&self.paths.chunks_dir)
                .map_err(|e| ContainerError::io(self.paths.chunks_dir.clone(), e))?;
        }
        if self.paths.metadata_dir.exists() {
            std::fs::remove_dir_all(&self.paths.metadata_dir)
                .map_err(|e| ContainerError::io(self.paths.metadata_dir.clone(), e))?;
        }
        if self.paths.container_root.exists() {
            std::fs::remove_dir_all(&self.paths.container_root)
                .map_err(|e| ContainerError::io(self.paths.container_root.clone(), e))?;
        }
        Ok(())
    }

    /// Same as [`Self::delete`], but the container lock wait is
    /// interruptible via `token` (§5 Cancellation & timeouts): a cancel
    /// requested while still waiting for the lock aborts with no side
    /// effects, since nothing has been removed from disk yet.
    pub fn delete_interruptible(&self, token: &CancelToken) -> Result<()> {
        self.apply_mutation_interruptible(
            token,
            "container.delete",
            |d| {
                if d.state.can_delete() {
                    Ok(())
                } else {
                    Err(ContainerError::InvalidState {
                        container_id: self.container_id,
                        current: d.state,
                    })
                }
            },
            || Ok(()),
            |d| d.state = ContainerState::Deleted,
        )?;

        self.store_cache.begin_exclusive(self.container_id);
        store::remove_store_files(&self.paths.store_dir)?;
        if self.paths.chunks_dir.exists() {
            std::fs::remove_dir_all(&self.paths.chunks_dir)
                .map_err(|e| ContainerError::io(self.paths.chunks_dir.clone(), e))?;
        }
        if self.paths.metadata_dir.exists() {
            std::fs::remove_dir_all(&self.paths.metadata_dir)
                .map_err(|e| ContainerError::io(self.paths.metadata_dir.clone(), e))?;
        }
        if self.paths.container_root.exists() {
            std::fs::remove_dir_all(&self.paths.container_root)
                .map_err(|e| ContainerError::io(self.paths.container_root.clone(), e))?;
        }
        Ok(())
    }

    /// Pack the container into `out`. Permitted only in `CLOSED` or
    /// `QUASI_CLOSED`; fails `InvalidState` before any archive bytes are
    /// written otherwise (§8).
    pub fn export_container_data<W: Write>(&self, out: W) -> Result<()> {
        let write_guard = self.inner.write();
        if !write_guard.descriptor.state.is_closed_family() {
            return Err(ContainerError::InvalidState {
                container_id: self.container_id,
                current: write_guard.descriptor.state,
            });
        }

        // Compact and evict the store handle so packing never races a
        // mutating database, then downgrade to a read lock for streaming.
        {
            let handle = self.store_cache.acquire(self.container_id, &self.paths.store_dir)?;
            handle.compact()?;
        }
        self.store_cache.begin_exclusive(self.container_id);

        let descriptor_bytes = write_guard.descriptor.clone().serialize().into_bytes();
        drop(write_guard);
        let read_guard = self.inner.read();

        let result = packer::pack(
            &self.paths.metadata_dir,
            &self.paths.chunks_dir,
            &descriptor_bytes,
            out,
        );

        drop(read_guard);
        self.store_cache.end_exclusive(self.container_id);
        result
    }

    /// Unpack archive data from `input` into this (freshly created, not yet
    /// described) container, overlay local paths, and rebuild in-memory
    /// counters by scanning the store. Any failure deletes everything that
    /// was created.
    pub fn import_container_data<R: Read>(&self, input: R) -> Result<()> {
        let attempt = (|| -> Result<ContainerDescriptor> {
            let descriptor_bytes = packer::unpack(&self.paths.container_root, input)?;
            let mut imported = descriptor::ContainerDescriptor::parse(&descriptor_bytes)
                .map_err(ContainerError::Internal)?;

            imported.container_id = self.container_id;
            let text = imported.serialize();
            descriptor::write_atomic(&self.paths.descriptor_file, text.as_bytes())?;

            let handle = self.store_handle()?;
            imported.key_count = handle.key_count();

            Ok(imported)
        })();

        match attempt {
            Ok(descriptor) => {
                let mut inner = self.inner.write();
                inner.descriptor = descriptor;
                Ok(())
            }
            Err(e) => {
                let _ = store::remove_store_files(&self.paths.store_dir);
                let _ = std::fs::remove_dir_all(&self.paths.chunks_dir);
                let _ = std::fs::remove_dir_all(&self.paths.metadata_dir);
                let _ = std::fs::remove_dir_all(&self.paths.container_root);
                Err(e)
            }
        }
    }
}
