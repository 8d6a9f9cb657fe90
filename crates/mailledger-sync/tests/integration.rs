//! End-to-end tests for the sync engine.
//!
//! Every test drives a full [`Engine`] against an [`InMemoryRemote`] with
//! scripted faults and latency.

#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mailledger_remote::{
    AccountId, Fault, FaultKind, InMemoryRemote, MessageId, Operation, RemoteApi, RemoteMessage,
    RemoteMutation,
};
use mailledger_sync::store::{
    AuxNamespace, CacheEntry, EvictionClass, Filter, Key, MessageBody, Record, Table,
};
use mailledger_sync::{
    Engine, EngineConfig, MutationOp, MutationTarget, PageRequest, RefreshOutcome, Resolution,
    SearchQuery,
};

const ACCOUNT: AccountId = AccountId(7);

fn config() -> EngineConfig {
    let mut config = EngineConfig {
        page_size: 50,
        ..EngineConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(2);
    config
}

fn message(id: &str, folder: &str, minute: u32) -> RemoteMessage {
    RemoteMessage {
        id: MessageId::from(id),
        folder: folder.into(),
        subject: Some(format!("Ticket {id}")),
        from_name: Some("Support".into()),
        from_email: Some("support@example.com".into()),
        date: Some(Utc.with_ymd_and_hms(2026, 7, 1, 9, minute % 60, minute / 60).unwrap()),
        labels: Some(vec!["support".into()]),
        ..RemoteMessage::default()
    }
}

fn seed(remote: &InMemoryRemote, folder: &str, ids: &[&str]) {
    for (minute, id) in (0..).zip(ids) {
        remote.upsert_message(ACCOUNT, message(id, folder, minute));
    }
}

async fn engine(remote: &Arc<InMemoryRemote>) -> Engine<InMemoryRemote> {
    Engine::in_memory(config(), Arc::clone(remote)).await.unwrap()
}

async fn stored_ids(engine: &Engine<InMemoryRemote>, folder: &str) -> Vec<String> {
    let mut ids: Vec<String> = engine
        .store()
        .folder_page(ACCOUNT, folder, mailledger_sync::SortOrder::DateDesc, 0, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.id.0)
        .collect();
    ids.sort();
    ids
}

/// Unique database path under the system temp dir.
fn temp_db(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "mailledger-sync-{name}-{}-{}.db",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ))
}

fn remove_db(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.clone().into_os_string();
        name.push(suffix);
        let _ = std::fs::remove_file(name);
    }
}

#[tokio::test]
async fn test_late_response_for_previous_folder_does_not_overwrite_view() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "A", &["a1", "a2"]);
    seed(&remote, "B", &["b1"]);
    remote.set_folder_latency("A", Duration::from_millis(250));
    let engine = engine(&remote).await;
    let front = engine.front(ACCOUNT);

    let gen_a = front.select_folder("A");
    let view_a = front.get_page(PageRequest::new("A", 0)).await.unwrap();
    assert_eq!(view_a.generation, gen_a);

    let gen_b = front.select_folder("B");
    assert!(gen_b > gen_a);
    let view_b = front.get_page(PageRequest::new("B", 0)).await.unwrap();

    let RefreshOutcome::Applied(shown) = view_b.refresh.outcome().await else {
        panic!("folder B refresh should apply");
    };
    assert!(matches!(view_a.refresh.outcome().await, RefreshOutcome::Discarded));
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].id.as_str(), "b1");

    // Persisted for later reads all the same.
    assert_eq!(stored_ids(&engine, "A").await, vec!["a1", "a2"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_replaying_delivered_entries_converges_to_same_state() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1", "m2"]);
    remote.add_folder(ACCOUNT, "Archive", Some("\\Archive"));
    let engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);

    let front = engine.front(ACCOUNT);
    let m1 = MutationTarget::Message(MessageId::from("m1"));
    let m2 = MutationTarget::Message(MessageId::from("m2"));
    let flag = MutationOp::SetFlags {
        seen: Some(true),
        flagged: Some(true),
    };
    let archive = MutationOp::Move {
        to: "Archive".into(),
    };
    front.enqueue_mutation(m1.clone(), flag).await.unwrap();
    front.enqueue_mutation(m1, archive).await.unwrap();
    front.enqueue_mutation(m2, MutationOp::Delete).await.unwrap();

    // The first delivery reached the server but the dequeue was lost.
    let id1 = MessageId::from("m1");
    remote
        .mutate(
            ACCOUNT,
            &id1,
            &RemoteMutation::SetFlags {
                seen: Some(true),
                flagged: Some(true),
            },
        )
        .await
        .unwrap();
    remote
        .mutate(ACCOUNT, &id1, &RemoteMutation::Move { to: "Archive".into() })
        .await
        .unwrap();
    remote.delete(ACCOUNT, &MessageId::from("m2")).await.unwrap();
    let after_first = engine.store().message(ACCOUNT, &id1).await.unwrap().unwrap();

    let report = engine.outbox().drain().await.unwrap();
    assert_eq!(report.completed, vec![1, 2, 3]);

    engine.sync_account(ACCOUNT).await.unwrap();
    let after_replay = engine.store().message(ACCOUNT, &id1).await.unwrap().unwrap();
    assert_eq!(after_replay.folder, after_first.folder);
    assert_eq!(after_replay.flags, after_first.flags);
    assert_eq!(after_replay.labels, after_first.labels);
    assert!(
        engine
            .store()
            .message(ACCOUNT, &MessageId::from("m2"))
            .await
            .unwrap()
            .is_none()
    );

    let server = remote.message(ACCOUNT, &id1).unwrap();
    assert_eq!(server.folder, "Archive");
    assert_eq!(server.seen, Some(true));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_writes_are_searchable_immediately() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["x1", "x2", "x3"]);
    remote.add_folder(ACCOUNT, "Archive", Some("\\Archive"));
    let engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);
    remote.set_offline(true);

    let front = engine.front(ACCOUNT);
    front
        .enqueue_mutation(MutationTarget::Message(MessageId::from("x1")), MutationOp::Delete)
        .await
        .unwrap();
    front
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("x2")),
            MutationOp::Move {
                to: "Archive".into(),
            },
        )
        .await
        .unwrap();
    front
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("x3")),
            MutationOp::SetFlags {
                seen: Some(true),
                flagged: None,
            },
        )
        .await
        .unwrap();

    let hit_ids = |hits: Vec<mailledger_sync::SearchHit>| {
        let mut ids: Vec<String> = hits.into_iter().map(|hit| hit.id.0).collect();
        ids.sort();
        ids
    };
    let all = engine.search(ACCOUNT, SearchQuery::text("ticket")).await.unwrap();
    assert_eq!(hit_ids(all), vec!["x2", "x3"]);
    let archived = engine
        .search(ACCOUNT, SearchQuery::text("ticket").in_folder("Archive"))
        .await
        .unwrap();
    assert_eq!(hit_ids(archived), vec!["x2"]);
    let unread = engine
        .search(ACCOUNT, SearchQuery::text("ticket").unread())
        .await
        .unwrap();
    assert_eq!(hit_ids(unread), vec!["x2"]);

    // The watermark still matches the store, so no rebuild is needed.
    assert_eq!(engine.store().index_meta(ACCOUNT).await.unwrap().unwrap().count, 2);
    assert_eq!(engine.store().message_count(ACCOUNT).await.unwrap(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_full_resync_prunes_exactly_the_missing_ids() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "F", &["1", "2", "3", "4"]);
    let engine = engine(&remote).await;
    engine.orchestrator().sync_folder(ACCOUNT, "F").await.unwrap();
    assert_eq!(stored_ids(&engine, "F").await, vec!["1", "2", "3", "4"]);

    remote.remove_message(ACCOUNT, &MessageId::from("4"));
    let summary = engine.orchestrator().full_resync(ACCOUNT, "F").await.unwrap();
    assert_eq!(summary.pruned, 1);
    assert_eq!(stored_ids(&engine, "F").await, vec!["1", "2", "3"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_pruning_skips_messages_with_pending_moves() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["i1"]);
    seed(&remote, "Archive", &["x"]);
    let engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);

    // Moved locally; the server still lists it under Archive.
    engine
        .front(ACCOUNT)
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("x")),
            MutationOp::Move { to: "INBOX".into() },
        )
        .await
        .unwrap();
    engine.orchestrator().full_resync(ACCOUNT, "INBOX").await.unwrap();
    assert_eq!(stored_ids(&engine, "INBOX").await, vec!["i1", "x"]);

    // A plain sync of Archive must not drag it back either.
    engine.orchestrator().full_resync(ACCOUNT, "Archive").await.unwrap();
    assert!(stored_ids(&engine, "Archive").await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_index_rebuilds_from_store_after_drift() {
    let path = temp_db("index-drift");
    let remote = Arc::new(InMemoryRemote::new());
    let ids: Vec<String> = (0..100).map(|n| format!("t{n:03}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    seed(&remote, "INBOX", &refs);

    let mut cfg = config();
    cfg.database_path.clone_from(&path);
    let engine = Engine::open(cfg.clone(), Arc::clone(&remote)).await.unwrap();
    engine.sync_account(ACCOUNT).await.unwrap();
    engine
        .indexer()
        .remove(ACCOUNT, vec![MessageId::from("t000"), MessageId::from("t001")])
        .await
        .unwrap();
    assert_eq!(engine.store().index_meta(ACCOUNT).await.unwrap().unwrap().count, 98);
    assert_eq!(engine.store().message_count(ACCOUNT).await.unwrap(), 100);
    engine.shutdown().await;

    let engine = Engine::open(cfg, Arc::clone(&remote)).await.unwrap();
    let mut converged = false;
    for _ in 0..200 {
        let stats = engine.indexer().stats(ACCOUNT).await.unwrap();
        if !stats.rebuilding && stats.persisted == Some(100) {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(converged, "index did not converge");
    assert_eq!(engine.store().index_meta(ACCOUNT).await.unwrap().unwrap().count, 100);

    for id in &ids {
        let hits = engine
            .search(ACCOUNT, SearchQuery::text(id.as_str()).limit(0))
            .await
            .unwrap();
        assert!(hits.iter().any(|hit| hit.id.as_str() == id), "{id} not found");
    }

    engine.shutdown().await;
    remove_db(&path);
}

#[tokio::test]
async fn test_eviction_order_and_protected_entries() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1", "m2", "m3"]);
    let engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    assert!(engine.store().index_payload(ACCOUNT).await.unwrap().is_some());

    let body = |id: &str| {
        Record::Body(MessageBody {
            account_id: ACCOUNT,
            id: MessageId::from(id),
            text: Some("x".repeat(1000)),
            html: None,
            attachments: Vec::new(),
            cached_at: Utc::now(),
        })
    };
    engine
        .store()
        .bulk_put(vec![
            body("m1"),
            body("m2"),
            Record::Aux(CacheEntry {
                namespace: AuxNamespace::AttachmentBlob,
                key: "m3/att-1".into(),
                value: vec![1; 800],
                owner: Some((ACCOUNT, MessageId::from("m3"))),
                cached_at: Utc::now(),
            }),
        ])
        .await
        .unwrap();

    engine.outbox().set_online(false);
    engine
        .front(ACCOUNT)
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("m1")),
            MutationOp::SetFlags {
                seen: Some(true),
                flagged: None,
            },
        )
        .await
        .unwrap();

    let folders_before = engine.store().count(Table::Folders, Filter::account(ACCOUNT)).await.unwrap();
    let manifests_before = engine
        .store()
        .count(Table::Manifests, Filter::account(ACCOUNT))
        .await
        .unwrap();

    let report = engine.evictor().free(1_000_000).await.unwrap();
    let classes: Vec<EvictionClass> = report.by_class.iter().map(|(class, _)| *class).collect();
    assert_eq!(
        classes,
        vec![
            EvictionClass::AttachmentBlobs,
            EvictionClass::IndexPayloads,
            EvictionClass::Bodies
        ]
    );

    let store = engine.store();
    assert!(store.get(Key::Body(ACCOUNT, MessageId::from("m1"))).await.unwrap().is_some());
    assert!(store.get(Key::Body(ACCOUNT, MessageId::from("m2"))).await.unwrap().is_none());
    assert_eq!(store.count(Table::Folders, Filter::account(ACCOUNT)).await.unwrap(), folders_before);
    assert_eq!(
        store.count(Table::Manifests, Filter::account(ACCOUNT)).await.unwrap(),
        manifests_before
    );
    assert_eq!(store.message_count(ACCOUNT).await.unwrap(), 3);
    assert_eq!(engine.outbox().pending(ACCOUNT).await.unwrap().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_entry_holds_its_target_until_resolved() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1", "m2"]);
    remote.inject(
        Fault::once(Operation::Mutate, FaultKind::Permanent(409))
            .on("m1")
            .after(1),
    );
    let engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);

    let front = engine.front(ACCOUNT);
    let mut changes = front.subscribe();
    let m1 = MutationTarget::Message(MessageId::from("m1"));
    for labels in [vec!["a"], vec!["b"], vec!["c"]] {
        front
            .enqueue_mutation(
                m1.clone(),
                MutationOp::AddLabels {
                    labels: labels.into_iter().map(String::from).collect(),
                },
            )
            .await
            .unwrap();
    }
    front
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("m2")),
            MutationOp::Delete,
        )
        .await
        .unwrap();

    let report = engine.outbox().drain().await.unwrap();
    assert_eq!(report.completed, vec![1, 4]);
    assert_eq!(report.failed, vec![2]);
    assert_eq!(report.held, vec![3]);

    let m1_calls = || {
        remote
            .calls_for(Operation::Mutate)
            .into_iter()
            .filter(|call| call.target == "m1")
            .count()
    };
    assert_eq!(m1_calls(), 2);
    assert!(remote.message(ACCOUNT, &MessageId::from("m2")).is_none());

    loop {
        if let mailledger_sync::ChangeEvent::MutationFailed(failure) = changes.recv().await.unwrap() {
            assert_eq!(failure.seq, 2);
            break;
        }
    }

    engine.outbox().drain().await.unwrap();
    assert_eq!(m1_calls(), 2);

    engine.outbox().resolve(ACCOUNT, 2, Resolution::Retry).await.unwrap();
    let report = engine.outbox().drain().await.unwrap();
    assert_eq!(report.completed, vec![2, 3]);

    let labels = remote.message(ACCOUNT, &MessageId::from("m1")).unwrap().labels.unwrap();
    assert_eq!(labels, vec!["support", "a", "b", "c"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_writes_drain_when_connectivity_returns() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1"]);
    let mut engine = engine(&remote).await;
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);
    engine.start_background();

    let front = engine.front(ACCOUNT);
    front
        .enqueue_mutation(
            MutationTarget::Message(MessageId::from("m1")),
            MutationOp::SetFlags {
                seen: Some(true),
                flagged: None,
            },
        )
        .await
        .unwrap();
    let local = engine.store().message(ACCOUNT, &MessageId::from("m1")).await.unwrap().unwrap();
    assert!(local.flags.seen);
    assert_eq!(remote.message(ACCOUNT, &MessageId::from("m1")).unwrap().seen, None);

    engine.outbox().set_online(true);
    for _ in 0..200 {
        if engine.outbox().pending(ACCOUNT).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.outbox().pending(ACCOUNT).await.unwrap().is_empty());
    assert_eq!(remote.message(ACCOUNT, &MessageId::from("m1")).unwrap().seen, Some(true));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_garbage_database_is_recreated() {
    let path = temp_db("garbage");
    std::fs::write(&path, vec![0xA5; 4096]).unwrap();

    let mut cfg = config();
    cfg.database_path.clone_from(&path);
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1"]);

    let engine = Engine::open(cfg, Arc::clone(&remote)).await.unwrap();
    assert!(engine.was_recovered());
    engine.watch(ACCOUNT).await.unwrap();
    engine.sync_account(ACCOUNT).await.unwrap();
    assert_eq!(engine.store().message_count(ACCOUNT).await.unwrap(), 1);

    engine.shutdown().await;
    remove_db(&path);
}

#[tokio::test]
async fn test_schema_version_mismatch_forces_fresh_store() {
    let path = temp_db("version");
    {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE legacy (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("PRAGMA user_version = 99").execute(&pool).await.unwrap();
        pool.close().await;
    }

    let mut cfg = config();
    cfg.database_path.clone_from(&path);
    let remote = Arc::new(InMemoryRemote::new());
    let engine = Engine::open(cfg.clone(), Arc::clone(&remote)).await.unwrap();
    assert!(engine.was_recovered());
    engine.shutdown().await;

    // The recreated store opens cleanly.
    let engine = Engine::open(cfg, remote).await.unwrap();
    assert!(!engine.was_recovered());
    engine.shutdown().await;
    remove_db(&path);
}

#[tokio::test]
async fn test_recover_wipes_and_resyncs_watched_accounts() {
    let remote = Arc::new(InMemoryRemote::new());
    seed(&remote, "INBOX", &["m1", "m2"]);
    let engine = engine(&remote).await;
    engine.watch(ACCOUNT).await.unwrap();
    engine.sync_account(ACCOUNT).await.unwrap();
    engine.outbox().set_online(false);
    engine
        .front(ACCOUNT)
        .enqueue_mutation(MutationTarget::Message(MessageId::from("m1")), MutationOp::Delete)
        .await
        .unwrap();
    assert_eq!(engine.store().message_count(ACCOUNT).await.unwrap(), 1);

    engine.recover().await.unwrap();

    assert_eq!(engine.store().message_count(ACCOUNT).await.unwrap(), 2);
    assert!(engine.outbox().pending(ACCOUNT).await.unwrap().is_empty());
    let hits = engine.search(ACCOUNT, SearchQuery::text("ticket")).await.unwrap();
    assert_eq!(hits.len(), 2);
    engine.shutdown().await;
}
