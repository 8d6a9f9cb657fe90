//! Search indexer unit.
//!
//! Holds one [`InvertedIndex`] per account, loaded lazily from the persisted
//! snapshot. Every change is written back to the store together with a
//! record-count watermark; a health check compares that watermark with the
//! store and rebuilds in the background when they drift.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use mailledger_remote::{AccountId, MessageId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::index::{InvertedIndex, SearchHit, SearchQuery};
use crate::config::IndexMode;
use crate::eviction::EvictionManager;
use crate::protocol::{Request, Response, UnitClient};
use crate::store::{
    Filter, IndexMeta, IndexPayload, Key, MessageRecord, Record, StoreHandle, Table,
};
use crate::{Error, Result};

/// Operations served by the indexer.
#[derive(Debug, Clone)]
pub enum IndexAction {
    /// Index or re-index message metadata.
    Index {
        /// Account.
        account: AccountId,
        /// Records to index.
        records: Vec<MessageRecord>,
    },
    /// Add body text to an indexed message.
    IndexBody {
        /// Account.
        account: AccountId,
        /// Message id.
        id: MessageId,
        /// Plain body text.
        text: String,
    },
    /// Drop messages.
    Remove {
        /// Account.
        account: AccountId,
        /// Message ids.
        ids: Vec<MessageId>,
    },
    /// Run a query.
    Search {
        /// Account.
        account: AccountId,
        /// Query.
        query: SearchQuery,
    },
    /// Rebuild from the store in the background.
    Rebuild {
        /// Account.
        account: AccountId,
    },
    /// Index statistics.
    Stats {
        /// Account.
        account: AccountId,
    },
    /// Compare the persisted watermark with the store.
    HealthCheck {
        /// Account.
        account: AccountId,
    },
    /// Forget one account's index.
    Reset {
        /// Account.
        account: AccountId,
    },
    /// Forget every in-memory index.
    ResetAll,
}

/// Indexer answers.
#[derive(Debug, Clone)]
pub enum IndexReply {
    /// Change applied.
    Done,
    /// Search results.
    Hits(Vec<SearchHit>),
    /// Statistics.
    Stats(IndexStats),
    /// Health check outcome.
    Health(IndexHealth),
}

/// Index statistics for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Messages in the live index.
    pub indexed: u64,
    /// Watermark of the persisted snapshot, if any.
    pub persisted: Option<u64>,
    /// Whether a rebuild is running.
    pub rebuilding: bool,
}

/// Health check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexHealth {
    /// Persisted watermark matches the store.
    Healthy,
    /// Counts differed; a rebuild was started.
    RebuildScheduled {
        /// Persisted watermark (zero if missing).
        indexed: u64,
        /// Messages in the store.
        stored: u64,
    },
}

/// Notifications from the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A rebuild finished and replaced the live index.
    Rebuilt {
        /// Account.
        account: AccountId,
        /// Messages in the new index.
        count: u64,
    },
}

/// Changes made while a rebuild runs, replayed onto its result.
#[derive(Debug)]
enum JournalEntry {
    Upsert(MessageRecord),
    Body(MessageId, String),
    Remove(MessageId),
}

impl JournalEntry {
    fn apply(self, index: &mut InvertedIndex) {
        match self {
            Self::Upsert(record) => index.upsert(&record),
            Self::Body(id, text) => {
                index.set_body(&id, &text);
            }
            Self::Remove(id) => {
                index.remove(&id);
            }
        }
    }
}

struct RebuildDone {
    account: AccountId,
    result: Result<InvertedIndex>,
}

struct Indexer {
    store: StoreHandle,
    evictor: EvictionManager,
    mode: IndexMode,
    indexes: HashMap<AccountId, InvertedIndex>,
    journals: HashMap<AccountId, Vec<JournalEntry>>,
    rebuild_tx: mpsc::UnboundedSender<RebuildDone>,
    events: broadcast::Sender<IndexEvent>,
}

impl Indexer {
    async fn handle(&mut self, action: IndexAction) -> Result<IndexReply> {
        match action {
            IndexAction::Index { account, records } => {
                let index = self.index_mut(account).await?;
                for record in &records {
                    index.upsert(record);
                }
                self.journal(account, records.into_iter().map(JournalEntry::Upsert));
                self.persist(account).await?;
                Ok(IndexReply::Done)
            }
            IndexAction::IndexBody { account, id, text } => {
                if self.index_mut(account).await?.set_body(&id, &text) {
                    self.journal(account, [JournalEntry::Body(id, text)]);
                    self.persist(account).await?;
                }
                Ok(IndexReply::Done)
            }
            IndexAction::Remove { account, ids } => {
                let index = self.index_mut(account).await?;
                let mut changed = false;
                for id in &ids {
                    changed |= index.remove(id);
                }
                self.journal(account, ids.into_iter().map(JournalEntry::Remove));
                if changed {
                    self.persist(account).await?;
                }
                Ok(IndexReply::Done)
            }
            IndexAction::Search { account, query } => {
                let hits = self.index_mut(account).await?.search(&query);
                Ok(IndexReply::Hits(hits))
            }
            IndexAction::Rebuild { account } => {
                self.start_rebuild(account);
                Ok(IndexReply::Done)
            }
            IndexAction::Stats { account } => {
                let indexed = to_u64(self.index_mut(account).await?.len());
                let persisted = self.store.index_meta(account).await?.map(|meta| meta.count);
                Ok(IndexReply::Stats(IndexStats {
                    indexed,
                    persisted,
                    rebuilding: self.journals.contains_key(&account),
                }))
            }
            IndexAction::HealthCheck { account } => self.health_check(account).await,
            IndexAction::Reset { account } => {
                self.indexes.remove(&account);
                self.journals.remove(&account);
                self.store
                    .bulk_delete(vec![Key::IndexPayload(account), Key::IndexMeta(account)])
                    .await?;
                Ok(IndexReply::Done)
            }
            IndexAction::ResetAll => {
                self.indexes.clear();
                self.journals.clear();
                Ok(IndexReply::Done)
            }
        }
    }

    async fn health_check(&mut self, account: AccountId) -> Result<IndexReply> {
        let persisted = self.store.index_meta(account).await?.map(|meta| meta.count);
        let stored = self.store.message_count(account).await?;
        if persisted == Some(stored) {
            return Ok(IndexReply::Health(IndexHealth::Healthy));
        }

        info!(
            "Index for account {account} covers {persisted:?} of {stored} messages, rebuilding"
        );
        self.start_rebuild(account);
        Ok(IndexReply::Health(IndexHealth::RebuildScheduled {
            indexed: persisted.unwrap_or(0),
            stored,
        }))
    }

    async fn index_mut(&mut self, account: AccountId) -> Result<&mut InvertedIndex> {
        if !self.indexes.contains_key(&account) {
            let index = self.load(account).await?;
            self.indexes.insert(account, index);
        }
        Ok(self.indexes.entry(account).or_default())
    }

    async fn load(&self, account: AccountId) -> Result<InvertedIndex> {
        let Some(payload) = self.store.index_payload(account).await? else {
            return Ok(InvertedIndex::new());
        };
        match InvertedIndex::from_payload(&payload.payload) {
            Ok(index) => {
                debug!("Loaded index for account {account} ({} messages)", index.len());
                Ok(index)
            }
            Err(e) => {
                // The next health check sees the watermark mismatch and rebuilds.
                warn!("Discarding unreadable index snapshot for account {account}: {e}");
                self.store.delete(Key::IndexMeta(account)).await?;
                Ok(InvertedIndex::new())
            }
        }
    }

    fn journal(&mut self, account: AccountId, entries: impl IntoIterator<Item = JournalEntry>) {
        if let Some(journal) = self.journals.get_mut(&account) {
            journal.extend(entries);
        }
    }

    async fn persist(&self, account: AccountId) -> Result<()> {
        let Some(index) = self.indexes.get(&account) else {
            return Ok(());
        };
        let now = Utc::now();
        let records = vec![
            Record::IndexPayload(IndexPayload {
                account_id: account,
                payload: index.to_payload()?,
                cached_at: now,
            }),
            Record::IndexMeta(IndexMeta {
                account_id: account,
                count: to_u64(index.len()),
                updated_at: now,
            }),
        ];
        self.evictor
            .guarded(|| self.store.bulk_put(records.clone()))
            .await
    }

    fn start_rebuild(&mut self, account: AccountId) {
        if self.journals.contains_key(&account) {
            debug!("Rebuild for account {account} already running");
            return;
        }
        self.journals.insert(account, Vec::new());

        let store = self.store.clone();
        let mode = self.mode;
        let done = self.rebuild_tx.clone();
        tokio::spawn(async move {
            let result = build_from_store(&store, account, mode).await;
            let _ = done.send(RebuildDone { account, result });
        });
    }

    async fn finish_rebuild(&mut self, done: RebuildDone) {
        let RebuildDone { account, result } = done;
        let Some(journal) = self.journals.remove(&account) else {
            debug!("Dropping rebuild for account {account} after reset");
            return;
        };

        match result {
            Ok(mut index) => {
                let replayed = journal.len();
                for entry in journal {
                    entry.apply(&mut index);
                }
                let count = to_u64(index.len());
                self.indexes.insert(account, index);
                if let Err(e) = self.persist(account).await {
                    warn!("Failed to persist rebuilt index for account {account}: {e}");
                }
                info!(
                    "Rebuilt index for account {account}: {count} messages, {replayed} journaled changes"
                );
                let _ = self.events.send(IndexEvent::Rebuilt { account, count });
            }
            Err(e) => warn!("Index rebuild for account {account} failed: {e}"),
        }
    }
}

async fn build_from_store(
    store: &StoreHandle,
    account: AccountId,
    mode: IndexMode,
) -> Result<InvertedIndex> {
    let mut index = InvertedIndex::new();
    for record in store.messages(account).await? {
        index.upsert(&record);
    }
    if mode == IndexMode::FullBody {
        for record in store.get_all(Table::Bodies, Filter::account(account)).await? {
            if let Record::Body(body) = record
                && let Some(text) = &body.text
            {
                index.set_body(&body.id, text);
            }
        }
    }
    Ok(index)
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Start the indexer unit.
///
/// Snapshot writes that hit the storage quota go through `evictor` and are
/// retried once.
#[must_use]
pub fn spawn_indexer(
    store: StoreHandle,
    evictor: EvictionManager,
    mode: IndexMode,
    timeout: Duration,
) -> (IndexerHandle, JoinHandle<()>) {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Request<IndexAction>>();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (rebuild_tx, mut rebuild_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(64);

    let mut indexer = Indexer {
        store,
        evictor,
        mode,
        indexes: HashMap::new(),
        journals: HashMap::new(),
        rebuild_tx,
        events: events.clone(),
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(Request { id, action }) = request else {
                        break;
                    };
                    let result = indexer.handle(action).await;
                    if let Err(e) = &result {
                        warn!("Indexer request failed: {e}");
                    }
                    if response_tx.send(Response { id, result }).is_err() {
                        break;
                    }
                }
                Some(done) = rebuild_rx.recv() => indexer.finish_rebuild(done).await,
            }
        }
        debug!("Indexer unit stopped");
    });

    let handle = IndexerHandle {
        client: UnitClient::new("indexer", request_tx, response_rx, timeout),
        events,
    };
    (handle, task)
}

/// Typed client for the indexer unit.
#[derive(Debug, Clone)]
pub struct IndexerHandle {
    client: UnitClient<Request<IndexAction>, Response<IndexReply>>,
    events: broadcast::Sender<IndexEvent>,
}

impl IndexerHandle {
    async fn call(&self, action: IndexAction) -> Result<IndexReply> {
        self.client
            .dispatch_with(|id| Request { id, action })
            .wait()
            .await
    }

    async fn call_done(&self, action: IndexAction) -> Result<()> {
        match self.call(action).await? {
            IndexReply::Done => Ok(()),
            _ => Err(Error::UnexpectedReply("indexer")),
        }
    }

    /// Subscribe to indexer notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Index or re-index message metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written, or a protocol error.
    pub async fn index(&self, account: AccountId, records: Vec<MessageRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.call_done(IndexAction::Index { account, records }).await
    }

    /// Add body text to an indexed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written, or a protocol error.
    pub async fn index_body(&self, account: AccountId, id: MessageId, text: String) -> Result<()> {
        self.call_done(IndexAction::IndexBody { account, id, text }).await
    }

    /// Drop messages from the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written, or a protocol error.
    pub async fn remove(&self, account: AccountId, ids: Vec<MessageId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call_done(IndexAction::Remove { account, ids }).await
    }

    /// Run a query.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be loaded, or a protocol error.
    pub async fn search(&self, account: AccountId, query: SearchQuery) -> Result<Vec<SearchHit>> {
        match self.call(IndexAction::Search { account, query }).await? {
            IndexReply::Hits(hits) => Ok(hits),
            _ => Err(Error::UnexpectedReply("indexer")),
        }
    }

    /// Start a background rebuild.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the unit is unreachable.
    pub async fn rebuild(&self, account: AccountId) -> Result<()> {
        self.call_done(IndexAction::Rebuild { account }).await
    }

    /// Index statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be loaded, or a protocol error.
    pub async fn stats(&self, account: AccountId) -> Result<IndexStats> {
        match self.call(IndexAction::Stats { account }).await? {
            IndexReply::Stats(stats) => Ok(stats),
            _ => Err(Error::UnexpectedReply("indexer")),
        }
    }

    /// Compare the persisted watermark with the store, rebuilding on drift.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, or a protocol error.
    pub async fn health_check(&self, account: AccountId) -> Result<IndexHealth> {
        match self.call(IndexAction::HealthCheck { account }).await? {
            IndexReply::Health(health) => Ok(health),
            _ => Err(Error::UnexpectedReply("indexer")),
        }
    }

    /// Forget one account's index, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be deleted, or a protocol error.
    pub async fn reset(&self, account: AccountId) -> Result<()> {
        self.call_done(IndexAction::Reset { account }).await
    }

    /// Forget every in-memory index.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the unit is unreachable.
    pub async fn reset_all(&self) -> Result<()> {
        self.call_done(IndexAction::ResetAll).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{AuxNamespace, CacheEntry, MessageDelta, PrimaryStore, spawn_store};

    const ACCOUNT: AccountId = AccountId(3);

    async fn units_with_quota(quota: u64) -> (StoreHandle, IndexerHandle) {
        let store = PrimaryStore::in_memory(quota).await.unwrap();
        let (store, _) = spawn_store(store, Duration::from_secs(5));
        let evictor = EvictionManager::new(store.clone(), 0.9, 0.5);
        let (indexer, _) = spawn_indexer(
            store.clone(),
            evictor,
            IndexMode::FullBody,
            Duration::from_secs(5),
        );
        (store, indexer)
    }

    async fn units() -> (StoreHandle, IndexerHandle) {
        units_with_quota(64 * 1024 * 1024).await
    }

    fn delta(i: usize) -> MessageDelta {
        MessageDelta {
            account_id: ACCOUNT,
            id: MessageId::new(format!("m{i}")),
            folder: "INBOX".into(),
            subject: Some(format!("weekly status {i}")),
            from_email: Some("team@example.com".into()),
            ..MessageDelta::default()
        }
    }

    #[tokio::test]
    async fn test_index_search_and_persist() {
        let (store, indexer) = units().await;
        let records = store.merge_messages(vec![delta(1), delta(2)]).await.unwrap();
        indexer.index(ACCOUNT, records).await.unwrap();
        indexer
            .index_body(ACCOUNT, MessageId::from("m1"), "quarterly numbers".into())
            .await
            .unwrap();

        let hits = indexer.search(ACCOUNT, SearchQuery::text("quarter")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, MessageId::from("m1"));

        let stats = indexer.stats(ACCOUNT).await.unwrap();
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.persisted, Some(2));
        assert_eq!(indexer.health_check(ACCOUNT).await.unwrap(), IndexHealth::Healthy);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let (store, indexer) = units().await;
        let records = store.merge_messages(vec![delta(1)]).await.unwrap();
        indexer.index(ACCOUNT, records).await.unwrap();

        let evictor = EvictionManager::new(store.clone(), 0.9, 0.5);
        let (fresh, _) = spawn_indexer(store, evictor, IndexMode::Metadata, Duration::from_secs(5));
        let hits = fresh.search(ACCOUNT, SearchQuery::text("weekly")).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_drift_triggers_rebuild_with_journal() {
        let (store, indexer) = units().await;
        let deltas: Vec<_> = (0..10).map(delta).collect();
        let records = store.merge_messages(deltas).await.unwrap();
        indexer.index(ACCOUNT, records[..8].to_vec()).await.unwrap();

        let mut events = indexer.subscribe();
        let health = indexer.health_check(ACCOUNT).await.unwrap();
        assert_eq!(health, IndexHealth::RebuildScheduled { indexed: 8, stored: 10 });

        // Written while the rebuild may still be running; must survive the swap.
        let late = store.merge_messages(vec![delta(10)]).await.unwrap();
        indexer.index(ACCOUNT, late).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, IndexEvent::Rebuilt { account: ACCOUNT, .. }));

        let stats = indexer.stats(ACCOUNT).await.unwrap();
        assert_eq!(stats.indexed, 11);
        assert!(!stats.rebuilding);
        assert_eq!(indexer.health_check(ACCOUNT).await.unwrap(), IndexHealth::Healthy);
    }

    #[tokio::test]
    async fn test_reset_drops_snapshot() {
        let (store, indexer) = units().await;
        let records = store.merge_messages(vec![delta(1)]).await.unwrap();
        indexer.index(ACCOUNT, records).await.unwrap();

        indexer.reset(ACCOUNT).await.unwrap();
        assert!(store.index_payload(ACCOUNT).await.unwrap().is_none());
        assert!(indexer.search(ACCOUNT, SearchQuery::text("weekly")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_over_quota_evicts_blobs_and_persists() {
        let (store, indexer) = units_with_quota(8 * 1024).await;
        store
            .put(Record::Aux(CacheEntry {
                namespace: AuxNamespace::AttachmentBlob,
                key: "att-1".into(),
                value: vec![0; 8000],
                owner: None,
                cached_at: Utc::now(),
            }))
            .await
            .unwrap();

        let records = store.merge_messages(vec![delta(1), delta(2)]).await.unwrap();
        indexer.index(ACCOUNT, records).await.unwrap();

        assert!(
            store
                .get(Key::Aux(AuxNamespace::AttachmentBlob, "att-1".into()))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.index_payload(ACCOUNT).await.unwrap().is_some());
        assert_eq!(indexer.stats(ACCOUNT).await.unwrap().persisted, Some(2));
    }
}
