//! Sync orchestrator.
//!
//! [`SyncPipeline`] does the work: fetch a page with retry, normalize, merge
//! into the store, prune after a full listing, index, then advance the
//! manifest cursor with a compare-and-set. The orchestrator unit wraps the
//! pipeline behind a request channel, runs each request on its own task, and
//! periodically syncs watched accounts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mailledger_remote::{AccountId, Cursor, MessageId, RawBody, RemoteApi};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::normalize;
use crate::config::{EngineConfig, IndexMode};
use crate::eviction::EvictionManager;
use crate::protocol::{Correlated, Request, RequestId, Response, UnitClient};
use crate::retry::RetryPolicy;
use crate::search::IndexerHandle;
use crate::store::{Folder, MessageBody, PruneWindow, Record, StoreHandle};
use crate::{Error, Result};

/// Pages fetched per folder sync before yielding.
const MAX_PAGES_PER_SYNC: u64 = 500;

/// Hook applied to every fetched body before it is stored.
///
/// Sanitization lives outside the engine; the default passes bodies through.
pub trait BodyTransform: Send + Sync + 'static {
    /// Transform a raw body.
    fn transform(&self, body: RawBody) -> RawBody;
}

/// Stores bodies as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl BodyTransform for IdentityTransform {
    fn transform(&self, body: RawBody) -> RawBody {
        body
    }
}

/// Outcome of one page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    /// Records written to the store.
    pub merged: usize,
    /// Stale records removed.
    pub pruned: usize,
    /// Whether the server has more pages.
    pub has_more: bool,
    /// Whether the manifest moved to `next_cursor`. False if another sync
    /// advanced it first.
    pub advanced: bool,
    /// Cursor returned by the server.
    pub next_cursor: Cursor,
}

/// Outcome of a folder or account sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Folders synced.
    pub folders: usize,
    /// Pages fetched.
    pub pages: u64,
    /// Records written.
    pub merged: usize,
    /// Stale records removed.
    pub pruned: usize,
    /// Folders that failed.
    pub failed: Vec<String>,
}

impl SyncSummary {
    fn absorb(&mut self, other: Self) {
        self.folders += other.folders;
        self.pages += other.pages;
        self.merged += other.merged;
        self.pruned += other.pruned;
        self.failed.extend(other.failed);
    }
}

/// The sync pipeline shared by the orchestrator unit and its direct callers.
pub struct SyncPipeline<R> {
    remote: Arc<R>,
    store: StoreHandle,
    indexer: IndexerHandle,
    evictor: EvictionManager,
    transform: Arc<dyn BodyTransform>,
    retry: RetryPolicy,
    page_size: u32,
    index_mode: IndexMode,
}

impl<R> std::fmt::Debug for SyncPipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("retry", &self.retry)
            .field("page_size", &self.page_size)
            .field("index_mode", &self.index_mode)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> SyncPipeline<R> {
    /// Assemble a pipeline.
    #[must_use]
    pub fn new(
        remote: Arc<R>,
        store: StoreHandle,
        indexer: IndexerHandle,
        evictor: EvictionManager,
        transform: Arc<dyn BodyTransform>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            remote,
            store,
            indexer,
            evictor,
            transform,
            retry: RetryPolicy::new(&config.retry, config.remote_timeout),
            page_size: config.page_size,
            index_mode: config.index_mode,
        }
    }

    /// Store handle used by the pipeline.
    #[must_use]
    pub const fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Indexer handle used by the pipeline.
    #[must_use]
    pub const fn indexer(&self) -> &IndexerHandle {
        &self.indexer
    }

    /// Fetch and store the folder list.
    ///
    /// # Errors
    ///
    /// Returns the remote error after retries, or a store error.
    pub async fn list_folders(&self, account: AccountId) -> Result<Vec<Folder>> {
        let remote = self
            .retry
            .run("list_folders", || self.remote.list_folders(account))
            .await?;
        let folders: Vec<Folder> = remote
            .into_iter()
            .map(|folder| normalize::folder(account, folder))
            .collect();

        self.store
            .bulk_put(folders.iter().cloned().map(Record::Folder).collect())
            .await?;
        debug!("Stored {} folders for account {account}", folders.len());
        Ok(folders)
    }

    /// Fetch one page.
    ///
    /// `cursor` defaults to the folder's stored cursor and `page_size` to the
    /// configured one. The stored cursor only moves when the page started at
    /// it, so fetching from an older cursor re-reads a window without
    /// rewinding the folder.
    ///
    /// # Errors
    ///
    /// Returns the remote error after retries, or a store or index error.
    pub async fn fetch_page(
        &self,
        account: AccountId,
        folder: &str,
        cursor: Option<Cursor>,
        page_size: Option<u32>,
    ) -> Result<PageOutcome> {
        let expected = match cursor {
            Some(cursor) => Some(cursor),
            None => self
                .store
                .manifest(account, folder)
                .await?
                .and_then(|manifest| manifest.cursor),
        };
        let mut listing = Vec::new();
        let full = expected.is_none();
        let page_size = page_size.filter(|&size| size > 0).unwrap_or(self.page_size);
        self.fetch_page_from(account, folder, expected, page_size, full.then_some(&mut listing))
            .await
    }

    /// Fetch one page starting at `expected`.
    ///
    /// `listing` is `Some` while paging through a full listing and collects
    /// every id returned so far; stored messages of the folder outside it are
    /// pruned within the range the listing covers. The cursor is only
    /// advanced once the page is both stored and indexed.
    async fn fetch_page_from(
        &self,
        account: AccountId,
        folder: &str,
        expected: Option<Cursor>,
        page_size: u32,
        listing: Option<&mut Vec<MessageId>>,
    ) -> Result<PageOutcome> {
        let page = self
            .retry
            .run("fetch_messages", || {
                self.remote
                    .fetch_messages(account, folder, expected.as_ref(), page_size)
            })
            .await?;

        let ids: Vec<MessageId> = page.messages.iter().map(|m| m.id.clone()).collect();
        let deltas = page
            .messages
            .into_iter()
            .map(|message| normalize::message_delta(account, folder, message))
            .collect();
        let merged = self.store.merge_messages(deltas).await?;

        let mut pruned = Vec::new();
        if let Some(listing) = listing {
            listing.extend(ids);
            let window = if page.has_more {
                merged
                    .iter()
                    .map(|record| record.date)
                    .min()
                    .map(PruneWindow::NewerThan)
            } else {
                Some(PruneWindow::Entire)
            };
            if let Some(window) = window {
                pruned = self
                    .store
                    .prune_folder(account, folder, listing.clone(), window)
                    .await?;
            }
        }

        self.indexer.remove(account, pruned.clone()).await?;
        self.indexer.index(account, merged.clone()).await?;

        let advanced = self
            .store
            .advance_manifest(account, folder, expected, page.next_cursor.clone(), 1)
            .await?;
        if !advanced {
            debug!("Cursor for {folder} moved during fetch, leaving it");
        }

        Ok(PageOutcome {
            merged: merged.len(),
            pruned: pruned.len(),
            has_more: page.has_more,
            advanced,
            next_cursor: page.next_cursor,
        })
    }

    /// Fetch pages until the folder is caught up.
    ///
    /// Starts a full listing when the folder has no cursor.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn sync_folder(&self, account: AccountId, folder: &str) -> Result<SyncSummary> {
        let mut cursor = self
            .store
            .manifest(account, folder)
            .await?
            .and_then(|manifest| manifest.cursor);
        let full = cursor.is_none();
        let mut listing = Vec::new();
        let mut summary = SyncSummary {
            folders: 1,
            ..SyncSummary::default()
        };

        loop {
            let outcome = self
                .fetch_page_from(
                    account,
                    folder,
                    cursor.clone(),
                    self.page_size,
                    if full { Some(&mut listing) } else { None },
                )
                .await?;
            summary.pages += 1;
            summary.merged += outcome.merged;
            summary.pruned += outcome.pruned;

            if !outcome.advanced || !outcome.has_more {
                break;
            }
            if summary.pages >= MAX_PAGES_PER_SYNC {
                info!("Stopping {folder} after {} pages", summary.pages);
                break;
            }
            cursor = Some(outcome.next_cursor);
        }

        debug!(
            "Synced {folder} for account {account}: {} pages, {} merged, {} pruned",
            summary.pages, summary.merged, summary.pruned
        );
        Ok(summary)
    }

    /// Forget the folder's cursor and sync it from scratch.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn full_resync(&self, account: AccountId, folder: &str) -> Result<SyncSummary> {
        self.store.reset_manifest(account, folder).await?;
        self.sync_folder(account, folder).await
    }

    /// Refresh the folder list, then sync every folder.
    ///
    /// A failing folder is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder list cannot be fetched or a unit is down.
    pub async fn sync_account(&self, account: AccountId) -> Result<SyncSummary> {
        let folders = self.list_folders(account).await?;
        let mut summary = SyncSummary::default();
        for folder in folders {
            match self.sync_folder(account, &folder.path).await {
                Ok(folder_summary) => summary.absorb(folder_summary),
                Err(e @ (Error::UnitUnavailable(_) | Error::Timeout { .. })) => return Err(e),
                Err(e) => {
                    warn!("Sync of {} for account {account} failed: {e}", folder.path);
                    summary.failed.push(folder.path);
                }
            }
        }
        Ok(summary)
    }

    /// Fetch, transform and store a message body.
    ///
    /// # Errors
    ///
    /// Returns the remote error after retries, or [`Error::QuotaExceeded`] if
    /// eviction could not make room.
    pub async fn fetch_body(&self, account: AccountId, id: &MessageId) -> Result<MessageBody> {
        let raw = self
            .retry
            .run("fetch_body", || self.remote.fetch_body(account, id))
            .await?;
        let body = normalize::body(account, self.transform.transform(raw));

        self.evictor
            .guarded(|| self.store.put(Record::Body(body.clone())))
            .await?;

        if self.index_mode == IndexMode::FullBody
            && let Some(text) = &body.text
            && let Err(e) = self.indexer.index_body(account, id.clone(), text.clone()).await
        {
            warn!("Failed to index body of {id}: {e}");
        }
        Ok(body)
    }
}

/// Quick requests answered with [`OrchestratorEvent::Response`].
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// Refresh the folder list.
    ListFolders {
        /// Account.
        account: AccountId,
    },
    /// Fetch one page.
    FetchPage {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
        /// Start cursor; the stored one when `None`.
        cursor: Option<Cursor>,
        /// Page size; the configured one when `None`.
        page_size: Option<u32>,
    },
    /// Fetch and store a body.
    FetchBody {
        /// Account.
        account: AccountId,
        /// Message id.
        id: MessageId,
    },
    /// Include an account in background syncs.
    Watch {
        /// Account.
        account: AccountId,
    },
    /// Drop an account from background syncs.
    Unwatch {
        /// Account.
        account: AccountId,
    },
}

/// Long-running tasks answered with [`OrchestratorEvent::RequestComplete`]
/// or [`OrchestratorEvent::RequestError`].
#[derive(Debug, Clone)]
pub enum SyncTask {
    /// Sync a folder until caught up.
    SyncFolder {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
    },
    /// Reset a folder's cursor and sync it.
    FullResync {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
    },
    /// Sync every folder of an account.
    SyncAccount {
        /// Account.
        account: AccountId,
    },
}

/// Inbound orchestrator messages.
#[derive(Debug)]
pub enum OrchestratorMessage {
    /// A quick request.
    Request(Request<SyncAction>),
    /// A long-running task.
    Task {
        /// Correlation id.
        task_id: RequestId,
        /// Task.
        task: SyncTask,
    },
}

/// Orchestrator reply payloads.
#[derive(Debug, Clone)]
pub enum SyncReply {
    /// Acknowledged.
    Done,
    /// Stored folders.
    Folders(Vec<Folder>),
    /// One page fetched.
    Page(PageOutcome),
    /// Stored body.
    Body(MessageBody),
    /// Folder or account sync finished.
    Synced(SyncSummary),
}

/// Outbound orchestrator messages.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// Answer to a [`SyncAction`].
    Response(Response<SyncReply>),
    /// A [`SyncTask`] finished.
    RequestComplete {
        /// Task id.
        request_id: RequestId,
        /// Outcome.
        result: SyncReply,
    },
    /// A [`SyncTask`] failed.
    RequestError {
        /// Task id.
        request_id: RequestId,
        /// Failure.
        error: Error,
    },
}

impl Correlated for OrchestratorEvent {
    type Output = SyncReply;

    fn into_parts(self) -> (RequestId, Result<SyncReply>) {
        match self {
            Self::Response(response) => (response.id, response.result),
            Self::RequestComplete { request_id, result } => (request_id, Ok(result)),
            Self::RequestError { request_id, error } => (request_id, Err(error)),
        }
    }
}

async fn run_action<R: RemoteApi>(pipeline: &SyncPipeline<R>, action: SyncAction) -> Result<SyncReply> {
    Ok(match action {
        SyncAction::ListFolders { account } => {
            SyncReply::Folders(pipeline.list_folders(account).await?)
        }
        SyncAction::FetchPage {
            account,
            folder,
            cursor,
            page_size,
        } => SyncReply::Page(pipeline.fetch_page(account, &folder, cursor, page_size).await?),
        SyncAction::FetchBody { account, id } => {
            SyncReply::Body(pipeline.fetch_body(account, &id).await?)
        }
        // Handled inline by the unit loop.
        SyncAction::Watch { .. } | SyncAction::Unwatch { .. } => SyncReply::Done,
    })
}

async fn run_task<R: RemoteApi>(pipeline: &SyncPipeline<R>, task: SyncTask) -> Result<SyncSummary> {
    match task {
        SyncTask::SyncFolder { account, folder } => pipeline.sync_folder(account, &folder).await,
        SyncTask::FullResync { account, folder } => pipeline.full_resync(account, &folder).await,
        SyncTask::SyncAccount { account } => pipeline.sync_account(account).await,
    }
}

/// Start the orchestrator unit.
///
/// Watched accounts are synced every `sync_interval`; a tick that finds the
/// previous background sync still running is skipped.
#[must_use]
pub fn spawn_orchestrator<R: RemoteApi>(
    pipeline: Arc<SyncPipeline<R>>,
    sync_interval: Duration,
    timeout: Duration,
    task_timeout: Duration,
) -> (OrchestratorHandle, JoinHandle<()>) {
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<OrchestratorMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<OrchestratorEvent>();

    let task = tokio::spawn(async move {
        let mut watched: BTreeSet<AccountId> = BTreeSet::new();
        let syncing = Arc::new(AtomicBool::new(false));
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + sync_interval, sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = message_rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    match message {
                        OrchestratorMessage::Request(Request { id, action: SyncAction::Watch { account } }) => {
                            if watched.insert(account) {
                                info!("Watching account {account}");
                            }
                            let indexer = pipeline.indexer().clone();
                            tokio::spawn(async move {
                                if let Err(e) = indexer.health_check(account).await {
                                    warn!("Index health check for account {account} failed: {e}");
                                }
                            });
                            let _ = event_tx.send(OrchestratorEvent::Response(Response {
                                id,
                                result: Ok(SyncReply::Done),
                            }));
                        }
                        OrchestratorMessage::Request(Request { id, action: SyncAction::Unwatch { account } }) => {
                            watched.remove(&account);
                            let _ = event_tx.send(OrchestratorEvent::Response(Response {
                                id,
                                result: Ok(SyncReply::Done),
                            }));
                        }
                        OrchestratorMessage::Request(Request { id, action }) => {
                            let pipeline = Arc::clone(&pipeline);
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                let result = run_action(&pipeline, action).await;
                                let _ = event_tx.send(OrchestratorEvent::Response(Response { id, result }));
                            });
                        }
                        OrchestratorMessage::Task { task_id, task } => {
                            let pipeline = Arc::clone(&pipeline);
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                let event = match run_task(&pipeline, task).await {
                                    Ok(summary) => OrchestratorEvent::RequestComplete {
                                        request_id: task_id,
                                        result: SyncReply::Synced(summary),
                                    },
                                    Err(error) => OrchestratorEvent::RequestError {
                                        request_id: task_id,
                                        error,
                                    },
                                };
                                let _ = event_tx.send(event);
                            });
                        }
                    }
                }
                _ = ticker.tick() => {
                    if watched.is_empty() {
                        continue;
                    }
                    if syncing.swap(true, Ordering::AcqRel) {
                        debug!("Background sync still running, skipping tick");
                        continue;
                    }
                    let accounts: Vec<AccountId> = watched.iter().copied().collect();
                    let pipeline = Arc::clone(&pipeline);
                    let syncing = Arc::clone(&syncing);
                    tokio::spawn(async move {
                        for account in accounts {
                            match pipeline.sync_account(account).await {
                                Ok(summary) => debug!("Background sync of account {account}: {summary:?}"),
                                Err(e) => warn!("Background sync of account {account} failed: {e}"),
                            }
                        }
                        syncing.store(false, Ordering::Release);
                    });
                }
            }
        }
        debug!("Orchestrator unit stopped");
    });

    let handle = OrchestratorHandle {
        client: UnitClient::new("orchestrator", message_tx, event_rx, timeout),
        task_timeout,
    };
    (handle, task)
}

/// Typed client for the orchestrator unit.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    client: UnitClient<OrchestratorMessage, OrchestratorEvent>,
    task_timeout: Duration,
}

impl OrchestratorHandle {
    async fn request(&self, action: SyncAction) -> Result<SyncReply> {
        self.client
            .dispatch_with(|id| OrchestratorMessage::Request(Request { id, action }))
            .wait()
            .await
    }

    async fn task(&self, task: SyncTask) -> Result<SyncSummary> {
        let reply = self
            .client
            .dispatch_with(|task_id| OrchestratorMessage::Task { task_id, task })
            .with_timeout(self.task_timeout)
            .wait()
            .await?;
        match reply {
            SyncReply::Synced(summary) => Ok(summary),
            _ => Err(Error::UnexpectedReply("orchestrator")),
        }
    }

    /// Returns true while the unit is running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Refresh the folder list.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn list_folders(&self, account: AccountId) -> Result<Vec<Folder>> {
        match self.request(SyncAction::ListFolders { account }).await? {
            SyncReply::Folders(folders) => Ok(folders),
            _ => Err(Error::UnexpectedReply("orchestrator")),
        }
    }

    /// Fetch one page, from `cursor` or the stored cursor, of `page_size`
    /// or the configured size.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn fetch_page(
        &self,
        account: AccountId,
        folder: &str,
        cursor: Option<Cursor>,
        page_size: Option<u32>,
    ) -> Result<PageOutcome> {
        let action = SyncAction::FetchPage {
            account,
            folder: folder.to_string(),
            cursor,
            page_size,
        };
        match self.request(action).await? {
            SyncReply::Page(outcome) => Ok(outcome),
            _ => Err(Error::UnexpectedReply("orchestrator")),
        }
    }

    /// Fetch and store a body.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn fetch_body(&self, account: AccountId, id: &MessageId) -> Result<MessageBody> {
        let action = SyncAction::FetchBody {
            account,
            id: id.clone(),
        };
        match self.request(action).await? {
            SyncReply::Body(body) => Ok(body),
            _ => Err(Error::UnexpectedReply("orchestrator")),
        }
    }

    /// Include an account in background syncs and check its index.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the unit is unreachable.
    pub async fn watch(&self, account: AccountId) -> Result<()> {
        self.request(SyncAction::Watch { account }).await.map(|_| ())
    }

    /// Drop an account from background syncs.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the unit is unreachable.
    pub async fn unwatch(&self, account: AccountId) -> Result<()> {
        self.request(SyncAction::Unwatch { account }).await.map(|_| ())
    }

    /// Sync a folder until caught up.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn sync_folder(&self, account: AccountId, folder: &str) -> Result<SyncSummary> {
        self.task(SyncTask::SyncFolder {
            account,
            folder: folder.to_string(),
        })
        .await
    }

    /// Reset a folder's cursor and sync it.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn full_resync(&self, account: AccountId, folder: &str) -> Result<SyncSummary> {
        self.task(SyncTask::FullResync {
            account,
            folder: folder.to_string(),
        })
        .await
    }

    /// Sync every folder of an account.
    ///
    /// # Errors
    ///
    /// Returns the sync error, or a protocol error if the unit is unreachable.
    pub async fn sync_account(&self, account: AccountId) -> Result<SyncSummary> {
        self.task(SyncTask::SyncAccount { account }).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mailledger_remote::{Fault, FaultKind, InMemoryRemote, Operation, RemoteMessage};

    use super::*;
    use crate::search::{SearchQuery, spawn_indexer};
    use crate::store::{PrimaryStore, spawn_store};

    const ACCOUNT: AccountId = AccountId(1);

    fn message(id: &str, folder: &str, day: u32) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::from(id),
            folder: folder.into(),
            subject: Some(format!("Subject {id}")),
            from_name: Some("Carol".into()),
            from_email: Some("carol@example.com".into()),
            date: Some(Utc.with_ymd_and_hms(2026, 5, day, 10, 0, 0).unwrap()),
            labels: Some(vec!["inbox".into()]),
            ..RemoteMessage::default()
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            page_size: 2,
            ..EngineConfig::default()
        };
        config.retry.base_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(2);
        config
    }

    async fn pipeline_with_indexer(
        remote: Arc<InMemoryRemote>,
    ) -> (Arc<SyncPipeline<InMemoryRemote>>, JoinHandle<()>) {
        let config = config();
        let store = PrimaryStore::in_memory(config.quota_bytes).await.unwrap();
        let (store, _) = spawn_store(store, config.unit_timeout);
        let evictor = EvictionManager::new(store.clone(), config.high_watermark, config.low_watermark);
        let (indexer, indexer_task) = spawn_indexer(
            store.clone(),
            evictor.clone(),
            config.index_mode,
            config.unit_timeout,
        );
        let pipeline = Arc::new(SyncPipeline::new(
            remote,
            store,
            indexer,
            evictor,
            Arc::new(IdentityTransform),
            &config,
        ));
        (pipeline, indexer_task)
    }

    async fn pipeline(remote: Arc<InMemoryRemote>) -> Arc<SyncPipeline<InMemoryRemote>> {
        pipeline_with_indexer(remote).await.0
    }

    async fn stored_cursor(pipeline: &SyncPipeline<InMemoryRemote>) -> Option<Cursor> {
        pipeline
            .store()
            .manifest(ACCOUNT, "INBOX")
            .await
            .unwrap()
            .and_then(|manifest| manifest.cursor)
    }

    fn seeded_remote(count: u32) -> Arc<InMemoryRemote> {
        let remote = Arc::new(InMemoryRemote::new());
        remote.add_folder(ACCOUNT, "INBOX", Some("\\Inbox"));
        for day in 1..=count {
            remote.upsert_message(ACCOUNT, message(&format!("m{day}"), "INBOX", day));
        }
        remote
    }

    #[tokio::test]
    async fn test_sync_folder_pages_through_and_advances_cursor() {
        let remote = seeded_remote(5);
        let pipeline = pipeline(Arc::clone(&remote)).await;

        let summary = pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.merged, 5);
        assert_eq!(pipeline.store().message_count(ACCOUNT).await.unwrap(), 5);

        let manifest = pipeline.store().manifest(ACCOUNT, "INBOX").await.unwrap().unwrap();
        assert_eq!(manifest.pages_fetched, 3);
        assert!(manifest.cursor.is_some());

        // Incremental: only the changed message comes back.
        let mut changed = message("m2", "INBOX", 2);
        changed.seen = Some(true);
        remote.upsert_message(ACCOUNT, changed);
        let summary = pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        assert_eq!(summary.merged, 1);
        let stored = pipeline
            .store()
            .message(ACCOUNT, &MessageId::from("m2"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.flags.seen);

        let hits = pipeline
            .indexer()
            .search(ACCOUNT, SearchQuery::text("subject"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[tokio::test]
    async fn test_full_resync_prunes_messages_gone_from_server() {
        let remote = seeded_remote(4);
        let pipeline = pipeline(Arc::clone(&remote)).await;
        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();

        remote.remove_message(ACCOUNT, &MessageId::from("m1"));
        remote.remove_message(ACCOUNT, &MessageId::from("m4"));
        let summary = pipeline.full_resync(ACCOUNT, "INBOX").await.unwrap();

        assert_eq!(summary.pruned, 2);
        assert_eq!(pipeline.store().message_count(ACCOUNT).await.unwrap(), 2);
        let hits = pipeline
            .indexer()
            .search(ACCOUNT, SearchQuery::text("subject"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_sparse_delta_keeps_known_fields() {
        let remote = seeded_remote(1);
        let pipeline = pipeline(Arc::clone(&remote)).await;
        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();

        remote.set_sparse_deltas(true);
        let mut changed = message("m1", "INBOX", 1);
        changed.flagged = Some(true);
        remote.upsert_message(ACCOUNT, changed);
        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();

        let stored = pipeline
            .store()
            .message(ACCOUNT, &MessageId::from("m1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.flags.flagged);
        assert_eq!(stored.from_name, "Carol");
        assert!(stored.labels.contains("inbox"));
    }

    #[tokio::test]
    async fn test_transient_fetch_is_retried() {
        let remote = seeded_remote(1);
        remote.inject(Fault::once(Operation::FetchMessages, FaultKind::Transient).times(2));
        let pipeline = pipeline(Arc::clone(&remote)).await;

        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        assert_eq!(remote.calls_for(Operation::FetchMessages).len(), 3);
    }

    #[tokio::test]
    async fn test_sync_account_lists_and_classifies_folders() {
        let remote = seeded_remote(2);
        remote.add_folder(ACCOUNT, "Sent Items", None);
        remote.upsert_message(ACCOUNT, message("s1", "Sent Items", 3));
        let pipeline = pipeline(Arc::clone(&remote)).await;

        let summary = pipeline.sync_account(ACCOUNT).await.unwrap();
        assert_eq!(summary.folders, 2);
        assert_eq!(summary.merged, 3);
        let folders = pipeline.store().folders(ACCOUNT).await.unwrap();
        assert!(folders.iter().any(|f| f.folder_type == crate::store::FolderType::Sent));
    }

    #[tokio::test]
    async fn test_handle_runs_tasks_and_requests() {
        let remote = seeded_remote(3);
        remote.set_body(
            ACCOUNT,
            RawBody {
                id: MessageId::from("m1"),
                text: Some("Body text".into()),
                html: None,
                attachments: Vec::new(),
            },
        );
        let pipeline = pipeline(Arc::clone(&remote)).await;
        let (handle, task) = spawn_orchestrator(
            Arc::clone(&pipeline),
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        let summary = handle.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        assert_eq!(summary.merged, 3);
        let body = handle.fetch_body(ACCOUNT, &MessageId::from("m1")).await.unwrap();
        assert_eq!(body.text.as_deref(), Some("Body text"));
        assert!(
            pipeline
                .store()
                .body(ACCOUNT, &MessageId::from("m1"))
                .await
                .unwrap()
                .is_some()
        );

        task.abort();
        let _ = task.await;
        let err = handle.sync_folder(ACCOUNT, "INBOX").await.unwrap_err();
        assert!(matches!(err, Error::UnitUnavailable("orchestrator")));
    }

    #[tokio::test]
    async fn test_task_errors_come_back_as_errors() {
        let remote = seeded_remote(1);
        remote.inject(Fault::once(Operation::FetchMessages, FaultKind::Permanent(403)));
        let pipeline = pipeline(remote).await;
        let (handle, _) = spawn_orchestrator(
            pipeline,
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        let err = handle.sync_folder(ACCOUNT, "INBOX").await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_cursor_for_retry() {
        let remote = seeded_remote(3);
        let pipeline = pipeline(Arc::clone(&remote)).await;
        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        let before = stored_cursor(&pipeline).await;
        assert!(before.is_some());

        remote.upsert_message(ACCOUNT, message("m4", "INBOX", 4));
        remote.inject(Fault::once(Operation::FetchMessages, FaultKind::Permanent(400)));
        let err = pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(stored_cursor(&pipeline).await, before);

        // The next attempt re-reads the window the failed one missed.
        let summary = pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        assert_eq!(summary.merged, 1);
        assert_ne!(stored_cursor(&pipeline).await, before);
    }

    #[tokio::test]
    async fn test_index_failure_leaves_cursor_for_retry() {
        let remote = seeded_remote(3);
        let (pipeline, indexer_task) = pipeline_with_indexer(Arc::clone(&remote)).await;
        pipeline.sync_folder(ACCOUNT, "INBOX").await.unwrap();
        let before = stored_cursor(&pipeline).await;

        remote.upsert_message(ACCOUNT, message("m4", "INBOX", 4));
        indexer_task.abort();
        let _ = indexer_task.await;

        let err = pipeline.fetch_page(ACCOUNT, "INBOX", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnitUnavailable("indexer") | Error::Timeout { .. }
        ));
        assert_eq!(stored_cursor(&pipeline).await, before);
    }

    #[tokio::test]
    async fn test_fetch_page_honours_cursor_and_page_size() {
        let remote = seeded_remote(6);
        let pipeline = pipeline(Arc::clone(&remote)).await;

        let first = pipeline.fetch_page(ACCOUNT, "INBOX", None, Some(4)).await.unwrap();
        assert_eq!(first.merged, 4);
        assert!(first.has_more);
        assert!(first.advanced);

        // Continues from the stored cursor with the configured size.
        let second = pipeline.fetch_page(ACCOUNT, "INBOX", None, None).await.unwrap();
        assert_eq!(second.merged, 2);
        assert!(!second.has_more);
        assert!(second.advanced);
        let caught_up = stored_cursor(&pipeline).await;
        assert_eq!(caught_up.as_ref(), Some(&second.next_cursor));

        // Re-reading an older window leaves the stored cursor alone.
        let window = pipeline
            .fetch_page(ACCOUNT, "INBOX", Some(first.next_cursor.clone()), Some(1))
            .await
            .unwrap();
        assert_eq!(window.merged, 1);
        assert!(!window.advanced);
        assert_eq!(stored_cursor(&pipeline).await, caught_up);
        assert_eq!(pipeline.store().message_count(ACCOUNT).await.unwrap(), 6);
    }
}
