//! Read path for one account.
//!
//! A page read answers from memory or the store right away and starts (or
//! joins) a background refresh. The refresh first re-reads the store, so
//! writes made behind a cached page show up even offline, then syncs the
//! folder and reads the page again. Its result reaches the caller only if the
//! generation captured when the read was issued is still current. Stale
//! results stay persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mailledger_remote::{AccountId, MessageId, RemoteApi};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::generation::{Generation, GenerationCounter};
use super::memory::MemoryCache;
use crate::config::EngineConfig;
use crate::outbox::{MutationFailure, MutationQueue};
use crate::search::IndexerHandle;
use crate::store::{
    MessageBody, MessageRecord, MutationEntry, MutationOp, MutationTarget, SortOrder, StoreHandle,
};
use crate::sync::{OrchestratorHandle, SyncPipeline, SyncSummary};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which page of which folder to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageRequest {
    /// Folder path.
    pub folder: String,
    /// Zero-based page number.
    pub page: u32,
    /// Ordering.
    pub sort: SortOrder,
}

impl PageRequest {
    /// Newest-first page of a folder.
    #[must_use]
    pub fn new(folder: impl Into<String>, page: u32) -> Self {
        Self {
            folder: folder.into(),
            page,
            sort: SortOrder::default(),
        }
    }

    /// Use a different ordering.
    #[must_use]
    pub const fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

/// Memory cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Account.
    pub account: AccountId,
    /// Folder path.
    pub folder: String,
    /// Page number.
    pub page: u32,
    /// Ordering.
    pub sort: SortOrder,
}

/// Where a page view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// In-memory cache.
    Memory,
    /// Primary store.
    Store,
}

/// How a background refresh ended.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The refreshed page, still current.
    Applied(Arc<Vec<MessageRecord>>),
    /// The scope changed before the refresh finished.
    Discarded,
    /// The refresh failed.
    Failed(Arc<Error>),
}

/// Pending result of a background refresh.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    rx: watch::Receiver<Option<RefreshOutcome>>,
}

impl RefreshHandle {
    /// Outcome if the refresh already finished.
    #[must_use]
    pub fn peek(&self) -> Option<RefreshOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the refresh to finish.
    pub async fn outcome(mut self) -> RefreshOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().unwrap_or(RefreshOutcome::Discarded),
            Err(_) => RefreshOutcome::Failed(Arc::new(Error::UnitUnavailable("cache front"))),
        }
    }
}

/// Result of a page read.
#[derive(Debug, Clone)]
pub struct PageView {
    /// Generation captured at issue time.
    pub generation: Generation,
    /// Records available now.
    pub records: Arc<Vec<MessageRecord>>,
    /// Where `records` came from.
    pub source: PageSource,
    /// Background refresh of the same page.
    pub refresh: RefreshHandle,
}

/// A message with its body, if one could be had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDetail {
    /// Metadata.
    pub record: MessageRecord,
    /// Body; `None` when it is not cached and the remote is unreachable.
    pub body: Option<MessageBody>,
}

/// Change notification for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A page refresh was applied.
    PageRefreshed {
        /// Page.
        key: PageKey,
        /// Generation it was applied under.
        generation: Generation,
    },
    /// A local write changed a message.
    MessageChanged {
        /// Message.
        id: MessageId,
        /// Folders whose listings changed.
        folders: Vec<String>,
    },
    /// The server rejected a queued write.
    MutationFailed(MutationFailure),
}

/// Chooses between the orchestrator and a direct pipeline call.
///
/// The direct path is taken only when the orchestrator is gone or did not
/// answer in time.
pub struct RefreshPolicy<R> {
    orchestrator: OrchestratorHandle,
    direct: Arc<SyncPipeline<R>>,
}

impl<R> Clone for RefreshPolicy<R> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            direct: Arc::clone(&self.direct),
        }
    }
}

impl<R> std::fmt::Debug for RefreshPolicy<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshPolicy")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> RefreshPolicy<R> {
    /// Create a policy.
    #[must_use]
    pub const fn new(orchestrator: OrchestratorHandle, direct: Arc<SyncPipeline<R>>) -> Self {
        Self {
            orchestrator,
            direct,
        }
    }

    fn indexer(&self) -> &IndexerHandle {
        self.direct.indexer()
    }

    fn falls_back(error: &Error) -> bool {
        matches!(
            error,
            Error::UnitUnavailable("orchestrator") | Error::Timeout { unit: "orchestrator", .. }
        )
    }

    async fn run<T, P, D, Fut>(&self, label: &str, primary: P, direct: D) -> Result<T>
    where
        P: Future<Output = Result<T>>,
        D: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match primary.await {
            Err(e) if Self::falls_back(&e) => {
                info!("{label} through orchestrator failed ({e}), calling directly");
                direct().await
            }
            other => other,
        }
    }

    /// Bring a folder up to date.
    ///
    /// # Errors
    ///
    /// Returns the sync error of whichever path ran.
    pub async fn sync_folder(&self, account: AccountId, folder: &str) -> Result<SyncSummary> {
        self.run(
            "sync_folder",
            self.orchestrator.sync_folder(account, folder),
            || self.direct.sync_folder(account, folder),
        )
        .await
    }

    /// Fetch and store a body.
    ///
    /// # Errors
    ///
    /// Returns the fetch error of whichever path ran.
    pub async fn fetch_body(&self, account: AccountId, id: &MessageId) -> Result<MessageBody> {
        self.run(
            "fetch_body",
            self.orchestrator.fetch_body(account, id),
            || self.direct.fetch_body(account, id),
        )
        .await
    }
}

struct FrontInner<R> {
    account: AccountId,
    store: StoreHandle,
    policy: RefreshPolicy<R>,
    queue: MutationQueue<R>,
    generation: GenerationCounter,
    memory: Mutex<MemoryCache<PageKey, Arc<Vec<MessageRecord>>>>,
    inflight: Mutex<HashMap<(PageKey, Generation), RefreshHandle>>,
    events: broadcast::Sender<ChangeEvent>,
    page_size: u32,
    forwarder: JoinHandle<()>,
}

impl<R> Drop for FrontInner<R> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Cache front for one account.
pub struct CacheFront<R> {
    inner: Arc<FrontInner<R>>,
}

impl<R> Clone for CacheFront<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for CacheFront<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFront")
            .field("account", &self.inner.account)
            .field("generation", &self.inner.generation.current())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> CacheFront<R> {
    /// Create a front for `account`.
    #[must_use]
    pub fn new(
        account: AccountId,
        store: StoreHandle,
        policy: RefreshPolicy<R>,
        queue: MutationQueue<R>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let forwarder = tokio::spawn(forward_failures(account, queue.subscribe(), events.clone()));
        Self {
            inner: Arc::new(FrontInner {
                account,
                store,
                policy,
                queue,
                generation: GenerationCounter::new(),
                memory: Mutex::new(MemoryCache::new(
                    config.memory_cache_ttl,
                    config.memory_cache_capacity,
                )),
                inflight: Mutex::new(HashMap::new()),
                events,
                page_size: config.page_size,
                forwarder,
            }),
        }
    }

    /// Account served by this front.
    #[must_use]
    pub fn account(&self) -> AccountId {
        self.inner.account
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.generation.current()
    }

    /// Switch the selected folder. Refreshes issued before this call are
    /// discarded when they finish.
    pub fn select_folder(&self, folder: &str) -> Generation {
        // Held so no refresh installs a page between its check and insert.
        let memory = lock(&self.inner.memory);
        let generation = self.inner.generation.advance();
        drop(memory);
        debug!("Selected {folder} for account {} at {generation}", self.inner.account);
        generation
    }

    /// Discard every pending and future refresh result.
    pub fn teardown(&self) {
        self.inner.generation.close();
        lock(&self.inner.memory).clear();
        lock(&self.inner.inflight).clear();
        self.inner.forwarder.abort();
        debug!("Cache front for account {} torn down", self.inner.account);
    }

    /// Receive change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    /// Read a page and start a background refresh of it.
    ///
    /// # Errors
    ///
    /// Returns a store error on a memory miss.
    pub async fn get_page(&self, request: PageRequest) -> Result<PageView> {
        let generation = self.inner.generation.current();
        let key = PageKey {
            account: self.inner.account,
            folder: request.folder,
            page: request.page,
            sort: request.sort,
        };

        let cached = lock(&self.inner.memory).get(&key);
        let (records, source) = if let Some(records) = cached {
            (records, PageSource::Memory)
        } else {
            let records = Arc::new(self.read_page(&key).await?);
            if !records.is_empty() {
                self.install(&key, generation, &records);
            }
            (records, PageSource::Store)
        };

        Ok(PageView {
            generation,
            records,
            source,
            refresh: self.refresh(key, generation),
        })
    }

    async fn read_page(&self, key: &PageKey) -> Result<Vec<MessageRecord>> {
        let limit = self.inner.page_size;
        self.inner
            .store
            .folder_page(
                key.account,
                &key.folder,
                key.sort,
                key.page.saturating_mul(limit),
                limit,
            )
            .await
    }

    /// Cache `records` for `key` if `generation` is still current.
    fn install(&self, key: &PageKey, generation: Generation, records: &Arc<Vec<MessageRecord>>) -> bool {
        let mut memory = lock(&self.inner.memory);
        if !self.inner.generation.is_current(generation) {
            return false;
        }
        memory.insert(key.clone(), Arc::clone(records));
        true
    }

    fn announce(&self, key: &PageKey, generation: Generation) {
        if self.inner.generation.is_current(generation) {
            let _ = self.inner.events.send(ChangeEvent::PageRefreshed {
                key: key.clone(),
                generation,
            });
        }
    }

    /// Re-read the store behind a cached page. Returns true if memory held
    /// something else.
    async fn reconcile(&self, key: &PageKey, generation: Generation) -> Result<bool> {
        let records = self.read_page(key).await?;
        let changed = lock(&self.inner.memory)
            .get(key)
            .is_none_or(|cached| *cached != records);
        if !changed || records.is_empty() {
            return Ok(false);
        }
        Ok(self.install(key, generation, &Arc::new(records)))
    }

    /// Start a refresh, or join the one already running for this page and
    /// generation.
    fn refresh(&self, key: PageKey, generation: Generation) -> RefreshHandle {
        let mut inflight = lock(&self.inner.inflight);
        if let Some(handle) = inflight.get(&(key.clone(), generation)) {
            return handle.clone();
        }

        let (tx, rx) = watch::channel(None);
        let handle = RefreshHandle { rx };
        inflight.insert((key.clone(), generation), handle.clone());
        drop(inflight);

        let front = self.clone();
        tokio::spawn(async move {
            let outcome = front.run_refresh(&key, generation).await;
            lock(&front.inner.inflight).remove(&(key, generation));
            tx.send_replace(Some(outcome));
        });
        handle
    }

    async fn run_refresh(&self, key: &PageKey, generation: Generation) -> RefreshOutcome {
        match self.reconcile(key, generation).await {
            Ok(true) => {
                debug!("Store changed behind cached {} page {}", key.folder, key.page);
                self.announce(key, generation);
            }
            Ok(false) => {}
            Err(e) => warn!("Re-reading {} page {} failed: {e}", key.folder, key.page),
        }

        let result = match self.inner.policy.sync_folder(key.account, &key.folder).await {
            Ok(_) => self.read_page(key).await,
            Err(e) => Err(e),
        };

        if !self.inner.generation.is_current(generation) {
            return Self::discarded(key, generation);
        }

        match result {
            Ok(records) => {
                let records = Arc::new(records);
                if !self.install(key, generation, &records) {
                    return Self::discarded(key, generation);
                }
                self.announce(key, generation);
                RefreshOutcome::Applied(records)
            }
            Err(e) => {
                warn!("Refresh of {} page {} failed: {e}", key.folder, key.page);
                RefreshOutcome::Failed(Arc::new(e))
            }
        }
    }

    fn discarded(key: &PageKey, generation: Generation) -> RefreshOutcome {
        debug!(
            "Discarding refresh of {} page {} captured at {generation}",
            key.folder, key.page
        );
        RefreshOutcome::Discarded
    }

    /// Message metadata with its body, fetching the body if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message is not stored, or a
    /// permanent fetch error.
    pub async fn get_message_detail(&self, id: &MessageId) -> Result<MessageDetail> {
        let account = self.inner.account;
        let record = self
            .inner
            .store
            .message(account, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;

        let body = match self.inner.store.body(account, id).await? {
            Some(body) => Some(body),
            None => match self.inner.policy.fetch_body(account, id).await {
                Ok(body) => Some(body),
                Err(e) if e.is_transient() => {
                    debug!("Body of {id} unavailable: {e}");
                    None
                }
                Err(e) => return Err(e),
            },
        };

        Ok(MessageDetail { record, body })
    }

    /// Queue a write, bring the search index in line with it and drop
    /// cached pages it affects.
    ///
    /// The entry is durable once this returns; an index update that fails is
    /// logged and left to the next health check.
    ///
    /// # Errors
    ///
    /// Returns the enqueue error.
    pub async fn enqueue_mutation(&self, target: MutationTarget, op: MutationOp) -> Result<MutationEntry> {
        let account = self.inner.account;
        let outcome = self.inner.queue.enqueue(account, target, op).await?;

        let affected = &outcome.affected_folders;
        lock(&self.inner.memory).invalidate_where(|key| affected.contains(&key.folder));

        if let Some(id) = outcome.entry.target.message_id() {
            if let Err(e) = self.reindex(id, outcome.record.clone()).await {
                warn!("Failed to update index for {id} after {}: {e}", outcome.entry.op.kind());
            }
            let _ = self.inner.events.send(ChangeEvent::MessageChanged {
                id: id.clone(),
                folders: outcome.affected_folders.clone(),
            });
        }
        Ok(outcome.entry)
    }

    /// Index the record a write left behind, or drop it if none is left.
    async fn reindex(&self, id: &MessageId, record: Option<MessageRecord>) -> Result<()> {
        let account = self.inner.account;
        let indexer = self.inner.policy.indexer();
        match record {
            Some(record) => indexer.index(account, vec![record]).await,
            None => indexer.remove(account, vec![id.clone()]).await,
        }
    }
}

async fn forward_failures(
    account: AccountId,
    mut failures: broadcast::Receiver<MutationFailure>,
    events: broadcast::Sender<ChangeEvent>,
) {
    loop {
        match failures.recv().await {
            Ok(failure) if failure.account_id == account => {
                let _ = events.send(ChangeEvent::MutationFailed(failure));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {missed} outbox failures for account {account}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use mailledger_remote::{InMemoryRemote, Operation, RawBody, RemoteMessage};

    use super::*;
    use crate::eviction::EvictionManager;
    use crate::search::{SearchQuery, spawn_indexer};
    use crate::store::{Key, MessageDelta, PrimaryStore, spawn_store};
    use crate::sync::{IdentityTransform, spawn_orchestrator};

    const ACCOUNT: AccountId = AccountId(1);

    struct Stack {
        remote: Arc<InMemoryRemote>,
        store: StoreHandle,
        front: CacheFront<InMemoryRemote>,
        orchestrator: JoinHandle<()>,
    }

    async fn stack() -> Stack {
        let config = EngineConfig {
            page_size: 10,
            ..EngineConfig::default()
        };
        let remote = Arc::new(InMemoryRemote::new());
        let store = PrimaryStore::in_memory(config.quota_bytes).await.unwrap();
        let (store, _) = spawn_store(store, config.unit_timeout);
        let evictor = EvictionManager::new(store.clone(), config.high_watermark, config.low_watermark);
        let (indexer, _) = spawn_indexer(
            store.clone(),
            evictor.clone(),
            config.index_mode,
            config.unit_timeout,
        );
        let pipeline = Arc::new(SyncPipeline::new(
            Arc::clone(&remote),
            store.clone(),
            indexer,
            evictor,
            Arc::new(IdentityTransform),
            &config,
        ));
        let (orchestrator, task) = spawn_orchestrator(
            Arc::clone(&pipeline),
            config.sync_interval,
            config.unit_timeout,
            config.task_timeout(),
        );
        let queue = MutationQueue::new(Arc::clone(&remote), store.clone(), &config);
        let front = CacheFront::new(
            ACCOUNT,
            store.clone(),
            RefreshPolicy::new(orchestrator, pipeline),
            queue,
            &config,
        );
        Stack {
            remote,
            store,
            front,
            orchestrator: task,
        }
    }

    fn seed(remote: &InMemoryRemote, folder: &str, ids: &[&str]) {
        for (day, id) in (1..).zip(ids) {
            remote.upsert_message(
                ACCOUNT,
                RemoteMessage {
                    id: MessageId::from(*id),
                    folder: folder.into(),
                    subject: Some(format!("Note {id}")),
                    date: Some(Utc.with_ymd_and_hms(2026, 6, day, 12, 0, 0).unwrap()),
                    ..RemoteMessage::default()
                },
            );
        }
    }

    fn ids(records: &[MessageRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_page_comes_from_store_then_memory() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a", "b"]);
        stack.front.select_folder("INBOX");

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Store);
        assert!(view.records.is_empty());

        let RefreshOutcome::Applied(records) = view.refresh.outcome().await else {
            panic!("refresh should apply");
        };
        assert_eq!(ids(&records), vec!["b", "a"]);

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Memory);
        assert_eq!(ids(&view.records), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_late_refresh_of_previous_folder_is_discarded() {
        let stack = stack().await;
        seed(&stack.remote, "A", &["a1"]);
        seed(&stack.remote, "B", &["b1"]);
        stack.remote.set_folder_latency("A", Duration::from_millis(200));
        let mut events = stack.front.subscribe();

        let first = stack.front.select_folder("A");
        let slow = stack.front.get_page(PageRequest::new("A", 0)).await.unwrap();
        assert_eq!(slow.generation, first);

        let second = stack.front.select_folder("B");
        let fast = stack.front.get_page(PageRequest::new("B", 0)).await.unwrap();
        assert!(matches!(fast.refresh.outcome().await, RefreshOutcome::Applied(_)));
        assert!(matches!(slow.refresh.outcome().await, RefreshOutcome::Discarded));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ChangeEvent::PageRefreshed { ref key, generation } if key.folder == "B" && generation == second
        ));

        // The discarded result still warmed the store.
        let view = stack.front.get_page(PageRequest::new("A", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Store);
        assert_eq!(ids(&view.records), vec!["a1"]);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_refresh() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a"]);
        stack.remote.set_folder_latency("INBOX", Duration::from_millis(50));

        let first = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        let second = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        first.refresh.outcome().await;
        second.refresh.outcome().await;

        assert_eq!(stack.remote.calls_for(Operation::FetchMessages).len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_falls_back_when_orchestrator_is_gone() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a"]);
        stack.orchestrator.abort();
        let _ = stack.orchestrator.await;

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        let RefreshOutcome::Applied(records) = view.refresh.outcome().await else {
            panic!("direct refresh should apply");
        };
        assert_eq!(ids(&records), vec!["a"]);
    }

    #[tokio::test]
    async fn test_detail_fetches_missing_body() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a"]);
        stack.remote.set_body(
            ACCOUNT,
            RawBody {
                id: MessageId::from("a"),
                text: Some("Full text".into()),
                html: None,
                attachments: Vec::new(),
            },
        );
        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        view.refresh.outcome().await;

        let detail = stack.front.get_message_detail(&MessageId::from("a")).await.unwrap();
        assert_eq!(detail.body.unwrap().text.as_deref(), Some("Full text"));

        stack.remote.set_offline(true);
        let err = stack
            .front
            .get_message_detail(&MessageId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cached_pages() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a", "b"]);
        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        view.refresh.outcome().await;
        let mut events = stack.front.subscribe();

        stack
            .front
            .enqueue_mutation(
                MutationTarget::Message(MessageId::from("a")),
                MutationOp::Move {
                    to: "Archive".into(),
                },
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ChangeEvent::MessageChanged { ref folders, .. } if folders.contains(&"INBOX".to_string())));

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Store);
        assert_eq!(ids(&view.records), vec!["b"]);
    }

    #[tokio::test]
    async fn test_teardown_discards_pending_refresh() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a"]);
        stack.remote.set_folder_latency("INBOX", Duration::from_millis(100));

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        stack.front.teardown();
        assert!(matches!(view.refresh.outcome().await, RefreshOutcome::Discarded));
    }

    #[tokio::test]
    async fn test_store_change_behind_cached_page_shows_up_offline() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a", "b"]);
        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        view.refresh.outcome().await;

        // Written by another front while this one still holds the page.
        stack.remote.set_offline(true);
        stack.store.delete(Key::Message(ACCOUNT, MessageId::from("a"))).await.unwrap();
        stack
            .store
            .merge_messages(vec![MessageDelta {
                account_id: ACCOUNT,
                id: MessageId::from("c"),
                folder: "INBOX".into(),
                subject: Some("Note c".into()),
                date: Some(Utc.with_ymd_and_hms(2026, 6, 9, 12, 0, 0).unwrap()),
                ..MessageDelta::default()
            }])
            .await
            .unwrap();
        let mut events = stack.front.subscribe();

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Memory);
        assert_eq!(ids(&view.records), vec!["b", "a"]);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ChangeEvent::PageRefreshed { ref key, .. } if key.folder == "INBOX"));

        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        assert_eq!(view.source, PageSource::Memory);
        assert_eq!(ids(&view.records), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_install_after_folder_switch_is_refused() {
        let stack = stack().await;
        let captured = stack.front.generation();
        let key = PageKey {
            account: ACCOUNT,
            folder: "INBOX".into(),
            page: 0,
            sort: SortOrder::default(),
        };
        stack.front.select_folder("Sent");

        let records = Arc::new(Vec::new());
        assert!(!stack.front.install(&key, captured, &records));
        assert!(lock(&stack.front.inner.memory).get(&key).is_none());
        assert!(stack.front.install(&key, stack.front.generation(), &records));
    }

    #[tokio::test]
    async fn test_mutation_updates_search_index() {
        let stack = stack().await;
        seed(&stack.remote, "INBOX", &["a", "b"]);
        let view = stack.front.get_page(PageRequest::new("INBOX", 0)).await.unwrap();
        view.refresh.outcome().await;
        stack.remote.set_offline(true);

        stack
            .front
            .enqueue_mutation(MutationTarget::Message(MessageId::from("a")), MutationOp::Delete)
            .await
            .unwrap();
        stack
            .front
            .enqueue_mutation(
                MutationTarget::Message(MessageId::from("b")),
                MutationOp::Move {
                    to: "Archive".into(),
                },
            )
            .await
            .unwrap();

        let indexer = stack.front.inner.policy.indexer();
        let hits = indexer.search(ACCOUNT, SearchQuery::text("note")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "b");
        let archived = indexer
            .search(ACCOUNT, SearchQuery::text("note").in_folder("Archive"))
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
    }
}
