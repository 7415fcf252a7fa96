//! Up and down cycles between clients sharing a remote.

mod common;

use std::sync::Arc;

use common::{mirror, Client, Entry};
use peersync_chunk::{CompressionAlgorithm, EncryptionAlgorithm, Transform};
use peersync_meta::{DATABASE_PREFIX, MULTICHUNK_PREFIX, TEMP_PREFIX, TRANSACTION_PREFIX};
use peersync_sync::storage::{Fault, StorageOp, UnreliableStorage};
use peersync_sync::{up, ApplyResult, CancelToken, DownStatus, MemoryStorage, SyncError, UpStatus};

const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn winner(status: &DownStatus) -> String {
    match status {
        DownStatus::Reconciled { winner } => winner.clone(),
        other => panic!("expected reconciliation, got {:?}", other),
    }
}

fn assert_converged(a: &Client, b: &Client) {
    assert_eq!(a.tree(), b.tree());
    assert_eq!(a.db_tree(), b.db_tree());
}

#[tokio::test]
async fn changes_propagate_between_clients() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);

    a.write("docs/readme.txt", b"read me first");
    a.write("notes.txt", b"short");
    a.mkdir("empty");
    let report = a.up().await;
    assert!(matches!(report.status, UpStatus::Uploaded { .. }));
    assert_eq!(report.changes.new.len(), 4);

    let report = b.down().await;
    assert_eq!(winner(&report.status), "A");
    assert!(!report.is_partial());
    assert_converged(&a, &b);
    assert_eq!(b.read("notes.txt"), b"short");

    a.write("notes.txt", b"a considerably longer note");
    a.rename("docs/readme.txt", "docs/guide.txt");
    a.remove("empty");
    let report = a.up().await;
    assert_eq!(report.changes.changed, vec!["notes.txt"]);
    assert_eq!(
        report.changes.renamed,
        vec![("docs/readme.txt".to_string(), "docs/guide.txt".to_string())]
    );
    assert_eq!(report.changes.deleted, vec!["empty"]);

    let report = b.down().await;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.action_failures().count(), 0);
    assert_converged(&a, &b);
    assert!(!b.exists("empty"));
    assert!(!b.exists("docs/readme.txt"));

    assert_eq!(b.up().await.status, UpStatus::NoChanges);
    assert_eq!(a.down().await.status, DownStatus::NoRemoteChanges);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_are_recreated() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);

    a.write("target.txt", b"pointed at");
    std::os::unix::fs::symlink("target.txt", a.path("link")).unwrap();
    a.up().await;
    b.down().await;

    assert_eq!(b.tree().get("link"), Some(&Entry::Symlink("target.txt".into())));
    assert_converged(&a, &b);
    assert_eq!(b.up().await.status, UpStatus::NoChanges);
}

#[tokio::test]
async fn encrypted_remote_syncs() {
    let remote = MemoryStorage::new();
    let encrypted = |config: &mut peersync_sync::SyncConfig| {
        config.transforms = vec![
            Transform::Compress(CompressionAlgorithm::Zstd { level: 3 }),
            Transform::Encrypt(EncryptionAlgorithm::AesGcm256),
        ];
        config.encryption_key_hex = Some(KEY.to_string());
    };
    let a = Client::open_with("A", Arc::new(remote.clone()), encrypted);
    let b = Client::open_with("B", Arc::new(remote.clone()), encrypted);

    let secret = b"plain text that must not reach the remote as is".repeat(4);
    a.write("secret.txt", &secret);
    a.up().await;

    for name in remote.names_with_prefix(MULTICHUNK_PREFIX) {
        let stored = remote.get(&name).unwrap();
        assert!(!stored.windows(16).any(|w| w == &secret[..16]));
    }

    b.down().await;
    assert_eq!(b.read("secret.txt"), secret);
}

#[tokio::test]
async fn concurrent_local_change_becomes_conflict_copy() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);

    a.write("shared.txt", b"base");
    a.up().await;
    b.down().await;

    a.write("shared.txt", b"edited on A");
    a.up().await;
    b.write("shared.txt", b"edited on B, not uploaded yet");

    let report = b.down().await;
    assert_eq!(report.action_failures().count(), 0);
    assert_eq!(b.read("shared.txt"), b"edited on A");
    let copies: Vec<(String, Entry)> = b
        .tree()
        .into_iter()
        .filter(|(path, _)| path.contains("B conflicted copy"))
        .collect();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].0.starts_with("shared ("));
    assert!(copies[0].0.ends_with(").txt"));
    assert_eq!(copies[0].1, Entry::File(b"edited on B, not uploaded yet".to_vec()));

    let report = b.up().await;
    assert_eq!(report.changes.new.len(), 1);
    a.down().await;
    assert_converged(&a, &b);
}

#[tokio::test]
async fn deleting_an_already_missing_folder_is_a_no_op() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);

    a.mkdir("old");
    a.write("keep.txt", b"keep");
    a.up().await;
    b.down().await;

    a.remove("old");
    a.up().await;
    b.remove("old");

    let report = b.down().await;
    assert_eq!(report.applied.len(), 1);
    assert!(report
        .outcomes
        .iter()
        .all(|o| matches!(o.result, Ok(ApplyResult::NoOp))));
    assert_converged(&a, &b);
}

#[tokio::test]
async fn concurrent_versions_pick_the_same_winner() {
    let remote_a = MemoryStorage::new();
    let remote_b = MemoryStorage::new();
    let a = Client::on_memory("A", &remote_a);
    let b = Client::on_memory("B", &remote_b);

    a.write("a.txt", b"from A");
    b.write("b.txt", b"from B");
    a.up().await;
    b.up().await;

    // both versions were written without seeing each other
    for name in remote_b.names() {
        remote_a.put(&name, remote_b.get(&name).unwrap());
    }
    mirror(&remote_a, &remote_b).await;

    let report_a = a.down().await;
    let report_b = b.down().await;
    let first = winner(&report_a.status);
    assert_eq!(winner(&report_b.status), first);

    let (w, w_remote, l, l_remote) = if first == "A" {
        (&a, &remote_a, &b, &remote_b)
    } else {
        (&b, &remote_b, &a, &remote_a)
    };
    let loser_id = l.ctx.client().to_string();
    assert!(l.exists("a.txt") && l.exists("b.txt"));
    assert!(!l_remote
        .names()
        .contains(&format!("db-{}-0000000001", loser_id)));

    // the loser's file is re-uploaded on top of the winning branch
    let report = l.up().await;
    match report.status {
        UpStatus::Uploaded { header, .. } => assert_eq!(header.sequence(), 2),
        other => panic!("unexpected status {:?}", other),
    }
    mirror(l_remote, w_remote).await;

    let report = w.down().await;
    assert_eq!(winner(&report.status), loser_id);
    assert_converged(w, l);
}

#[tokio::test]
async fn winner_keeps_uploading_while_the_loser_is_offline() {
    let remote_a = MemoryStorage::new();
    let remote_b = MemoryStorage::new();
    let a = Client::on_memory("A", &remote_a);
    let b = Client::on_memory("B", &remote_b);

    a.write("a.txt", b"from A");
    a.up().await;
    b.write("b.txt", b"from B");
    b.up().await;
    for name in remote_b.names() {
        remote_a.put(&name, remote_b.get(&name).unwrap());
    }

    // the earlier version wins; B's losing file stays on the remote
    let report = a.down().await;
    assert_eq!(winner(&report.status), "A");
    assert!(remote_a.get("db-B-0000000001").is_some());

    a.write("later.txt", b"written after the conflict");
    let report = a.up().await;
    assert!(
        matches!(report.status, UpStatus::Uploaded { ref header, .. } if header.sequence() == 2),
        "unexpected status {:?}",
        report.status
    );
    assert_eq!(a.down().await.status, DownStatus::NoRemoteChanges);
    assert_eq!(a.up().await.status, UpStatus::NoChanges);

    // the loser catches up later and converges
    mirror(&remote_a, &remote_b).await;
    let report = b.down().await;
    assert_eq!(winner(&report.status), "A");
    assert_eq!(report.pruned.len(), 1);
    assert!(b.exists("b.txt") && b.exists("later.txt"));
    assert!(matches!(b.up().await.status, UpStatus::Uploaded { .. }));
    mirror(&remote_b, &remote_a).await;
    a.down().await;
    assert_converged(&a, &b);
}

#[tokio::test]
async fn failed_commit_leaves_only_the_previous_transaction() {
    let remote = MemoryStorage::new();
    let storage = Arc::new(
        UnreliableStorage::new(Arc::new(remote.clone()))
            .with_fault(Fault::on(StorageOp::Move).name_contains("db-A-0000000002")),
    );
    let a = Client::open("A", storage.clone());

    a.write("first.txt", b"first");
    a.up().await;
    a.write("second.txt", b"second file");

    let err = up(&a.ctx, &CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, SyncError::Transaction { .. }), "unexpected error {}", err);
    assert_eq!(storage.injected(), 1);
    assert_eq!(remote.names_with_prefix(DATABASE_PREFIX), vec!["db-A-0000000001"]);
    assert_eq!(remote.names_with_prefix(MULTICHUNK_PREFIX).len(), 1);
    assert!(remote.names_with_prefix(TEMP_PREFIX).is_empty());
    assert!(remote.names_with_prefix(TRANSACTION_PREFIX).is_empty());
    assert_eq!(a.ctx.database().version_count().unwrap(), 1);

    let report = a.up().await;
    assert!(matches!(report.status, UpStatus::Uploaded { ref header, .. } if header.sequence() == 2));
    assert_eq!(
        remote.names_with_prefix(DATABASE_PREFIX),
        vec!["db-A-0000000001", "db-A-0000000002"]
    );
    assert_eq!(remote.names_with_prefix(MULTICHUNK_PREFIX).len(), 2);

    let b = Client::on_memory("B", &remote);
    b.down().await;
    assert_converged(&a, &b);
}

#[tokio::test]
async fn tampered_multichunk_aborts_before_touching_the_folder() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);

    a.write("data.bin", b"content that will be tampered with");
    a.up().await;

    let name = remote.names_with_prefix(MULTICHUNK_PREFIX).remove(0);
    let mut bytes = remote.get(&name).unwrap().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    remote.put(&name, bytes);

    let err = peersync_sync::down(&b.ctx, &CancelToken::none()).await.unwrap_err();
    assert!(err.is_integrity(), "unexpected error {}", err);
    assert!(b.tree().is_empty());
    assert_eq!(b.ctx.database().version_count().unwrap(), 0);
}

#[tokio::test]
async fn corrupt_database_file_is_reported_and_skipped() {
    let remote = MemoryStorage::new();
    let a = Client::on_memory("A", &remote);
    let b = Client::on_memory("B", &remote);
    a.write("a.txt", b"from A");
    a.up().await;
    remote.put("db-C-0000000001", b"not a database version".to_vec());

    let report = b.down().await;
    assert_eq!(winner(&report.status), "A");
    assert_eq!(report.failed_artifacts.len(), 1);
    assert_eq!(report.failed_artifacts[0].name, "db-C-0000000001");
    assert!(report.is_partial());
    assert_eq!(b.read("a.txt"), b"from A");
}
