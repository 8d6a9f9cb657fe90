//! Mutation queue (outbox).
//!
//! User writes are applied to the store optimistically and recorded as
//! durable outbox entries. A drain replays them against the remote in
//! sequence order. Entries for one target run strictly one after another;
//! distinct targets drain in parallel up to the configured concurrency.
//!
//! A permanent failure marks the entry failed and holds every later entry
//! for the same target until the failure is resolved. Other targets keep
//! draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mailledger_remote::{AccountId, Error as RemoteError, RemoteApi};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::retry::RetryPolicy;
use crate::store::{
    EnqueueOutcome, EntryStatus, MutationEntry, MutationOp, MutationTarget, Resolution,
    StoreHandle,
};
use crate::{Error, Result};

/// A delivery the server rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationFailure {
    /// Owning account.
    pub account_id: AccountId,
    /// Entry sequence.
    pub seq: u64,
    /// Addressed entity.
    pub target: MutationTarget,
    /// Operation name.
    pub op: String,
    /// Server error.
    pub error: String,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Delivered and removed.
    pub completed: Vec<u64>,
    /// Still pending after transient failures.
    pub deferred: Vec<u64>,
    /// Rejected by the server in this drain.
    pub failed: Vec<u64>,
    /// Waiting behind a failed entry for the same target.
    pub held: Vec<u64>,
}

impl DrainReport {
    fn absorb(&mut self, other: Self) {
        self.completed.extend(other.completed);
        self.deferred.extend(other.deferred);
        self.failed.extend(other.failed);
        self.held.extend(other.held);
    }

    fn sort(&mut self) {
        self.completed.sort_unstable();
        self.deferred.sort_unstable();
        self.failed.sort_unstable();
        self.held.sort_unstable();
    }
}

struct QueueInner<R> {
    remote: Arc<R>,
    store: StoreHandle,
    retry: RetryPolicy,
    online: watch::Sender<bool>,
    appended: Notify,
    permits: Arc<Semaphore>,
    failures: broadcast::Sender<MutationFailure>,
    drain_gate: Mutex<()>,
}

/// Durable outbox replayed against the remote.
pub struct MutationQueue<R> {
    inner: Arc<QueueInner<R>>,
}

impl<R> Clone for MutationQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for MutationQueue<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("online", &*self.inner.online.borrow())
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> MutationQueue<R> {
    /// Create a queue. It starts online.
    #[must_use]
    pub fn new(remote: Arc<R>, store: StoreHandle, config: &EngineConfig) -> Self {
        let (online, _) = watch::channel(true);
        let (failures, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(QueueInner {
                remote,
                store,
                retry: RetryPolicy::new(&config.retry, config.remote_timeout),
                online,
                appended: Notify::new(),
                permits: Arc::new(Semaphore::new(config.drain_concurrency.max(1))),
                failures,
                drain_gate: Mutex::new(()),
            }),
        }
    }

    /// Receive permanent delivery failures.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MutationFailure> {
        self.inner.failures.subscribe()
    }

    /// Append a write and apply it to the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWrite`] if the operation does not fit the
    /// target, or a store error.
    pub async fn enqueue(
        &self,
        account: AccountId,
        target: MutationTarget,
        op: MutationOp,
    ) -> Result<EnqueueOutcome> {
        let outcome = self.inner.store.enqueue_mutation(account, target, op).await?;
        debug!(
            "Queued {} #{} for {}",
            outcome.entry.op.kind(),
            outcome.entry.seq,
            outcome.entry.target.key()
        );
        if self.is_online() {
            self.inner.appended.notify_one();
        }
        Ok(outcome)
    }

    /// Entries waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn pending(&self, account: AccountId) -> Result<Vec<MutationEntry>> {
        self.with_status(account, EntryStatus::Pending).await
    }

    /// Entries rejected by the server and awaiting resolution.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn failed(&self, account: AccountId) -> Result<Vec<MutationEntry>> {
        self.with_status(account, EntryStatus::Failed).await
    }

    async fn with_status(&self, account: AccountId, status: EntryStatus) -> Result<Vec<MutationEntry>> {
        let mut entries = self.inner.store.mutations(account).await?;
        entries.retain(|entry| entry.status == status);
        Ok(entries)
    }

    /// Retry or discard a failed entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn resolve(&self, account: AccountId, seq: u64, resolution: Resolution) -> Result<()> {
        self.inner.store.resolve_mutation(account, seq, resolution).await?;
        info!("Resolved outbox entry {account}/{seq}: {resolution:?}");
        if resolution == Resolution::Retry && self.is_online() {
            self.inner.appended.notify_one();
        }
        Ok(())
    }

    /// Report connectivity. Going online triggers a drain in [`run`](Self::run).
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.send_replace(online);
        if was != online {
            info!("Outbox {}", if online { "online" } else { "offline" });
        }
    }

    /// Last reported connectivity.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Replay every account's outbox once.
    ///
    /// Drains are serialized; a call made during a drain waits for it.
    ///
    /// # Errors
    ///
    /// Returns a store error. Delivery failures are reported in the
    /// [`DrainReport`], not as errors.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _gate = self.inner.drain_gate.lock().await;
        let mut report = DrainReport::default();
        for account in self.inner.store.outbox_accounts().await? {
            report.absorb(self.drain_account(account).await?);
        }
        report.sort();
        if report != DrainReport::default() {
            info!(
                "Outbox drain: {} completed, {} deferred, {} failed, {} held",
                report.completed.len(),
                report.deferred.len(),
                report.failed.len(),
                report.held.len()
            );
        }
        Ok(report)
    }

    async fn drain_account(&self, account: AccountId) -> Result<DrainReport> {
        let mut entries = self.inner.store.mutations(account).await?;
        entries.sort_by_key(|entry| entry.seq);

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<MutationEntry>> = HashMap::new();
        for entry in entries {
            let key = entry.target.key();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(entry);
        }

        let mut tasks = JoinSet::new();
        for key in order {
            let Some(group) = groups.remove(&key) else {
                continue;
            };
            let queue = self.clone();
            let permits = Arc::clone(&self.inner.permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::UnitUnavailable("outbox"))?;
                queue.drain_target(account, group).await
            });
        }

        let mut report = DrainReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.absorb(result?),
                Err(e) => warn!("Outbox drain task for account {account} panicked: {e}"),
            }
        }
        Ok(report)
    }

    /// Deliver one target's entries in order, stopping at the first failure.
    async fn drain_target(&self, account: AccountId, group: Vec<MutationEntry>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut entries = group.into_iter();

        while let Some(entry) = entries.next() {
            if entry.status == EntryStatus::Failed {
                report.held.extend(entries.map(|e| e.seq));
                break;
            }

            match self.deliver(account, &entry).await {
                Ok(()) => {
                    self.inner.store.complete_mutation(account, entry.seq).await?;
                    report.completed.push(entry.seq);
                }
                Err(e) if e.is_transient() => {
                    warn!("Delivery of {account}/{} deferred: {e}", entry.seq);
                    self.inner
                        .store
                        .fail_mutation(account, entry.seq, e.to_string(), false)
                        .await?;
                    report.deferred.push(entry.seq);
                    report.deferred.extend(entries.map(|e| e.seq));
                    break;
                }
                Err(e) => {
                    warn!("Delivery of {account}/{} rejected: {e}", entry.seq);
                    self.inner
                        .store
                        .fail_mutation(account, entry.seq, e.to_string(), true)
                        .await?;
                    let _ = self.inner.failures.send(MutationFailure {
                        account_id: account,
                        seq: entry.seq,
                        target: entry.target.clone(),
                        op: entry.op.kind().to_string(),
                        error: e.to_string(),
                    });
                    report.failed.push(entry.seq);
                    report.held.extend(entries.map(|e| e.seq));
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Run the remote call for one entry.
    ///
    /// A missing message counts as delivered for deletes and moves; a send
    /// has no such shortcut.
    async fn deliver(&self, account: AccountId, entry: &MutationEntry) -> std::result::Result<(), RemoteError> {
        let remote = &self.inner.remote;
        let retry = &self.inner.retry;
        let result = match (&entry.target, &entry.op) {
            (MutationTarget::Message(id), MutationOp::Delete) => {
                retry.run("delete", || remote.delete(account, id)).await
            }
            (MutationTarget::Message(id), op) => {
                let Some(mutation) = op.to_remote() else {
                    return Err(RemoteError::from_status(
                        400,
                        format!("{} cannot address a message", op.kind()),
                    ));
                };
                retry.run("mutate", || remote.mutate(account, id, &mutation)).await
            }
            (MutationTarget::Outgoing(_), MutationOp::Send { message }) => {
                return retry
                    .run("send", || remote.send(account, message))
                    .await
                    .map(|receipt| debug!("Sent {} as {}", message.client_id, receipt.message_id));
            }
            (MutationTarget::Outgoing(_), op) => {
                return Err(RemoteError::from_status(
                    400,
                    format!("{} cannot address an outgoing message", op.kind()),
                ));
            }
        };

        match result {
            Err(e) if e.is_not_found() => {
                debug!("{account}/{} already applied: {e}", entry.seq);
                Ok(())
            }
            other => other,
        }
    }

    /// Drain on connectivity regain, on append while online, and every
    /// `period` while entries remain.
    pub async fn run(self, period: Duration) {
        let mut online = self.inner.online.subscribe();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                }
                () = self.inner.appended.notified() => {}
                _ = ticker.tick() => {}
            }

            if !self.is_online() {
                continue;
            }
            match self.drain().await {
                Ok(_) => {}
                Err(Error::UnitUnavailable(unit)) => {
                    debug!("Outbox loop stopping, {unit} is gone");
                    break;
                }
                Err(e) => warn!("Outbox drain failed: {e}"),
            }
        }
    }
}
