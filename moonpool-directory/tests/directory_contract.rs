//! Contract shared by every pluggable directory backend.

use std::sync::Arc;
use std::time::Duration;

use moonpool_directory::{
    ActivationAddress, ActivationId, DirectoryEntry, DirectoryError, GrainDirectory, GrainId,
    InMemoryKeyValueStore, InMemoryTableStore, KeyValueGrainDirectory, OperationResult,
    PluggableGrainDirectory, RetryPolicy, SiloAddress, TableClient, TableGrainDirectory,
    VersionTag,
};

const RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    delay: Duration::from_millis(100),
};

fn entry(grain: &str, host: u8, activation: u128) -> DirectoryEntry {
    let address = ActivationAddress::new(
        GrainId::parse(grain).expect("grain"),
        SiloAddress::parse(&format!("10.0.0.{host}:100@1")).expect("silo"),
        ActivationId::new(activation),
    );
    DirectoryEntry::from_address(&address, VersionTag::NONE)
}

fn kv() -> (Arc<InMemoryKeyValueStore>, Arc<dyn GrainDirectory>) {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let directory = PluggableGrainDirectory::with_retry(
        KeyValueGrainDirectory::new("cluster-1", store.clone()),
        RETRY,
    );
    (store, Arc::new(directory))
}

fn table() -> (Arc<InMemoryTableStore>, Arc<dyn GrainDirectory>) {
    let store = Arc::new(InMemoryTableStore::new());
    let directory = PluggableGrainDirectory::with_retry(
        TableGrainDirectory::new("cluster-1", store.clone()),
        RETRY,
    );
    (store, Arc::new(directory))
}

/// Register `entry` and return what the directory stored, tag included.
async fn stored(directory: &dyn GrainDirectory, entry: &DirectoryEntry) -> DirectoryEntry {
    match directory.register(entry.clone()).await {
        OperationResult::Success { entry: kept } => {
            assert_eq!(kept.activation_address, entry.activation_address);
            kept
        }
        other => panic!("expected success, got {other:?}"),
    }
}

async fn check_round_trip(directory: &dyn GrainDirectory) {
    let a = stored(directory, &entry("user/42", 1, 0xA)).await;
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), Some(a));
}

async fn check_first_writer_wins(directory: &dyn GrainDirectory) {
    let a = stored(directory, &entry("user/42", 1, 0xA)).await;
    let b = entry("user/42", 2, 0xB);

    match directory.register(b.clone()).await {
        OperationResult::Redirect { entry, actual } => {
            assert_eq!(entry, b);
            assert_eq!(actual, a);
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), Some(a));
}

async fn check_lookup_miss(directory: &dyn GrainDirectory) {
    assert_eq!(directory.lookup("user/never").await.expect("lookup"), None);
}

async fn check_conditional_unregister(directory: &dyn GrainDirectory) {
    let a = stored(directory, &entry("user/42", 1, 0xA)).await;
    let stale = entry("user/42", 2, 0xB);

    assert!(directory.unregister(stale).await.is_success());
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), Some(a.clone()));

    assert!(directory.unregister(a.clone()).await.is_success());
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), None);

    // Already gone: still a success.
    assert!(directory.unregister(a).await.is_success());
}

async fn check_reregister_after_unregister(directory: &dyn GrainDirectory) {
    let a = stored(directory, &entry("user/42", 1, 0xA)).await;
    assert!(directory.unregister(a).await.is_success());
    let b = stored(directory, &entry("user/42", 2, 0xB)).await;
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), Some(b));
}

async fn check_concurrent_registration(directory: Arc<dyn GrainDirectory>) {
    let a = entry("user/42", 1, 0xA);
    let b = entry("user/42", 2, 0xB);

    let first = tokio::spawn({
        let directory = directory.clone();
        let a = a.clone();
        async move { directory.register(a).await }
    });
    let second = tokio::spawn({
        let directory = directory.clone();
        let b = b.clone();
        async move { directory.register(b).await }
    });
    let first = first.await.expect("task").into_authoritative().expect("first");
    let second = second.await.expect("task").into_authoritative().expect("second");

    assert_eq!(first, second);
    assert!(
        first.activation_address == a.activation_address
            || first.activation_address == b.activation_address
    );
    assert_eq!(directory.lookup("user/42").await.expect("lookup"), Some(first));
}

async fn check_batches(directory: &dyn GrainDirectory) {
    let entries: Vec<_> = (0..4)
        .map(|i| entry(&format!("user/{i}"), 1, i as u128 + 1))
        .collect();
    let results = directory.register_many(entries.clone()).await;
    assert!(results.iter().all(OperationResult::is_success));

    let ids: Vec<String> = entries.iter().map(|e| e.grain_id.clone()).collect();
    let found = directory.lookup_many(&ids).await;
    for (entry, found) in entries.iter().zip(found) {
        let found = found.expect("lookup").expect("registered");
        assert_eq!(found.activation_address, entry.activation_address);
    }
}

#[tokio::test]
async fn test_table_store_entries_carry_etag() {
    let (store, directory) = table();
    let a = stored(directory.as_ref(), &entry("user/42", 1, 0xA)).await;
    assert_ne!(a.version(), VersionTag::NONE);

    let (row, etag) = store
        .read("cluster-1", "user%2F42")
        .await
        .expect("read")
        .expect("row");
    assert_eq!(a.version(), VersionTag::from_etag(&etag));

    // A concurrent writer moves the row on; the old tag no longer deletes it.
    store.overwrite(row);
    assert!(!directory.unregister(a.clone()).await.is_success());
    let current = directory
        .lookup("user/42")
        .await
        .expect("lookup")
        .expect("still registered");
    assert!(current.version() > a.version());
    assert!(directory.unregister(current).await.is_success());
    assert!(directory.lookup("user/42").await.expect("lookup").is_none());
}

#[tokio::test]
async fn test_key_value_entries_are_untagged() {
    let (_, directory) = kv();
    let a = stored(directory.as_ref(), &entry("user/42", 1, 0xA)).await;
    assert_eq!(a.version(), VersionTag::NONE);
}

macro_rules! contract {
    ($name:ident, $check:ident) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn key_value() {
                let (_, directory) = kv();
                $check(directory.as_ref()).await;
            }

            #[tokio::test]
            async fn table_store() {
                let (_, directory) = table();
                $check(directory.as_ref()).await;
            }
        }
    };
}

contract!(round_trip, check_round_trip);
contract!(first_writer_wins, check_first_writer_wins);
contract!(lookup_miss, check_lookup_miss);
contract!(conditional_unregister, check_conditional_unregister);
contract!(reregister_after_unregister, check_reregister_after_unregister);
contract!(batches, check_batches);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_key_value() {
    for _ in 0..20 {
        let (_, directory) = kv();
        check_concurrent_registration(directory).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_table_store() {
    for _ in 0..20 {
        let (_, directory) = table();
        check_concurrent_registration(directory).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_key_value() {
    let (store, directory) = kv();
    assert!(directory.register(entry("user/1", 1, 1)).await.is_success());
    store.fail_next(2);
    assert!(directory.lookup("user/1").await.expect("lookup").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_table_store() {
    let (store, directory) = table();
    assert!(directory.register(entry("user/1", 1, 1)).await.is_success());
    store.fail_next(2);
    assert!(directory.unregister(entry("user/1", 1, 1)).await.is_success());
    assert!(directory.lookup("user/1").await.expect("lookup").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_as_failure() {
    let (store, directory) = table();
    assert!(directory.register(entry("user/1", 1, 1)).await.is_success());
    store.fail_next(3);
    let err = directory.lookup("user/1").await.expect_err("exhausted");
    assert!(matches!(err, DirectoryError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_malformed_entry_is_failure_not_panic() {
    let (_, directory) = kv();
    let bogus = DirectoryEntry::new("user/1", "not an address", "");
    assert!(matches!(
        directory.register(bogus).await,
        OperationResult::Failure {
            cause: DirectoryError::Parse(_),
            ..
        }
    ));
}
