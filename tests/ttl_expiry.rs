//! Time-to-live behavior: the expiry worker deletes keys on schedule,
//! tolerates racing explicit deletes, persists its deadline map across
//! shutdown, and refuses to start twice.

use std::time::Duration;

use tempfile::tempdir;

use volkv::config::EXPIRY_FILE_NAME;
use volkv::{store_error, StoreError, Volume};

#[test]
fn short_and_long_ttls_expire_on_their_own_schedules() {
    let dir = tempdir().unwrap();
    let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();
    volume.start_auto_delete().unwrap();

    for key in 1..=5u64 {
        volume.put_with_ttl(key, "short".to_string(), 1).unwrap();
    }
    for key in 6..=10u64 {
        volume.put_with_ttl(key, "long".to_string(), 5).unwrap();
    }

    std::thread::sleep(Duration::from_secs(2));
    for key in 1..=5u64 {
        assert_eq!(volume.get(key).unwrap(), None, "key {key} should expire");
    }
    for key in 6..=10u64 {
        assert_eq!(
            volume.get(key).unwrap(),
            Some("long".to_string()),
            "key {key} must outlive the short deadline"
        );
    }

    std::thread::sleep(Duration::from_secs(4));
    for key in 6..=10u64 {
        assert_eq!(volume.get(key).unwrap(), None, "key {key} should expire");
    }

    volume.stop_and_flush().unwrap();
}

#[test]
fn explicit_delete_beats_the_worker_without_noise() {
    let dir = tempdir().unwrap();
    let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();
    volume.start_auto_delete().unwrap();

    volume.put_with_ttl(7, "short".to_string(), 1).unwrap();
    volume.delete(7).unwrap();

    // The worker's deadline scan finds nothing to delete and must not
    // disturb the rest of the volume.
    volume.put(8, "keep".to_string()).unwrap();
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(volume.get(7).unwrap(), None);
    assert_eq!(volume.get(8).unwrap(), Some("keep".to_string()));

    volume.stop_and_flush().unwrap();
}

#[test]
fn stop_persists_deadlines_and_restart_honors_them() {
    let dir = tempdir().unwrap();
    {
        let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();
        volume.start_auto_delete().unwrap();
        volume
            .put_with_ttl(42, "persisted".to_string(), 3_600)
            .unwrap();
        volume.stop_and_flush().unwrap();
    }

    assert!(dir.path().join(EXPIRY_FILE_NAME).exists());

    let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();
    // The deadline is an hour out: restarting the worker must not delete
    // the key early.
    volume.start_auto_delete().unwrap();
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(volume.get(42).unwrap(), Some("persisted".to_string()));
    volume.stop_and_flush().unwrap();
}

#[test]
fn ttl_without_a_running_worker_records_nothing() {
    let dir = tempdir().unwrap();
    let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();

    volume.put_with_ttl(1, "immortal".to_string(), 1).unwrap();
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(volume.get(1).unwrap(), Some("immortal".to_string()));

    volume.stop_and_flush().unwrap();
    assert!(!dir.path().join(EXPIRY_FILE_NAME).exists());
}

#[test]
fn starting_the_worker_twice_is_rejected() {
    let dir = tempdir().unwrap();
    let volume: Volume<String> = Volume::open_with_capacity(dir.path(), 1024).unwrap();

    volume.start_auto_delete().unwrap();
    let err = volume.start_auto_delete().unwrap_err();
    assert!(matches!(
        store_error(&err),
        Some(StoreError::AlreadyStarted)
    ));
    volume.stop_and_flush().unwrap();
}
