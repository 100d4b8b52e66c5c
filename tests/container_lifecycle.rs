//! End-to-end container lifecycle scenarios (§8).

use std::sync::Arc;

use kvcontainer_engine::container::state::ContainerState;
use kvcontainer_engine::container::store::StoreCache;
use kvcontainer_engine::container::Container;
use kvcontainer_engine::volume::Volume;
use kvcontainer_engine::ContainerError;

fn new_container(id: u64) -> (Container, tempfile::TempDir, Arc<Volume>) {
    let dir = tempfile::tempdir().unwrap();
    let volume = Arc::new(Volume::new(dir.path(), 1 << 30));
    let cache = StoreCache::new();
    let container = Container::create(volume.clone(), cache, "scm-1", id, 1 << 20, "node-a").unwrap();
    (container, dir, volume)
}

#[test]
fn create_close_export_round_trip() {
    let (container, _dir, _vol) = new_container(100);
    assert_eq!(container.state(), ContainerState::Open);

    container.mark_for_close().unwrap();
    assert_eq!(container.state(), ContainerState::Closing);

    container.close().unwrap();
    assert_eq!(container.state(), ContainerState::Closed);

    let mut archive = Vec::new();
    container.export_container_data(&mut archive).unwrap();
    assert!(!archive.is_empty());
}

#[test]
fn illegal_close_from_closed_fails_not_open() {
    let (container, _dir, _vol) = new_container(101);
    container.close().unwrap();

    let err = container.mark_for_close().unwrap_err();
    assert!(matches!(err, ContainerError::NotOpen { .. }));
    assert_eq!(container.state(), ContainerState::Closed);
}

#[test]
fn failed_descriptor_write_rolls_back_in_memory_state() {
    let (container, dir, _vol) = new_container(102);
    let meta_dir = dir.path().join("scm-1").join("102").join("metadata");

    let mut perms = std::fs::metadata(&meta_dir).unwrap().permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(&meta_dir, perms.clone()).unwrap();

    let result = container.mark_for_close();

    perms.set_readonly(false);
    std::fs::set_permissions(&meta_dir, perms).unwrap();

    assert!(result.is_err());
    assert_eq!(container.state(), ContainerState::Open);
}
