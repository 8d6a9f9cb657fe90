//! Engine assembly and recovery supervision.
//!
//! [`Engine`] spawns the store, indexer and orchestrator units, wires the
//! outbox, eviction manager and cache fronts to them, and owns their tasks.
//! A store that fails its version or integrity check at open is deleted and
//! recreated; the next sync of every folder is then a full resync.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mailledger_remote::{AccountId, RemoteApi};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheFront, RefreshPolicy};
use crate::config::EngineConfig;
use crate::eviction::EvictionManager;
use crate::outbox::MutationQueue;
use crate::search::{IndexHealth, IndexerHandle, SearchHit, SearchQuery, spawn_indexer};
use crate::store::{PrimaryStore, StoreHandle, spawn_store};
use crate::sync::{
    BodyTransform, IdentityTransform, OrchestratorHandle, SyncPipeline, SyncSummary,
    spawn_orchestrator,
};
use crate::Result;

/// The running sync engine.
pub struct Engine<R> {
    config: EngineConfig,
    store: StoreHandle,
    indexer: IndexerHandle,
    orchestrator: OrchestratorHandle,
    pipeline: Arc<SyncPipeline<R>>,
    queue: MutationQueue<R>,
    evictor: EvictionManager,
    units: Vec<(&'static str, JoinHandle<()>)>,
    background: Vec<JoinHandle<()>>,
    watched: Mutex<BTreeSet<AccountId>>,
    recovered: bool,
}

impl<R> std::fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("database_path", &self.config.database_path)
            .field("recovered", &self.recovered)
            .field("background", &self.background.len())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> Engine<R> {
    /// Open the engine on the configured database file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, or a store error that recovery could
    /// not fix.
    pub async fn open(config: EngineConfig, remote: Arc<R>) -> Result<Self> {
        Self::open_with(config, remote, Arc::new(IdentityTransform)).await
    }

    /// Open the engine with a body transform.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, or a store error that recovery could
    /// not fix.
    pub async fn open_with(
        config: EngineConfig,
        remote: Arc<R>,
        transform: Arc<dyn BodyTransform>,
    ) -> Result<Self> {
        config.validate()?;
        let path = config.database_path.clone();

        let (store, recovered) = match PrimaryStore::new(&path, config.quota_bytes).await {
            Ok(store) => (store, false),
            Err(e) if e.requires_recovery() => {
                warn!("Store at {} is unusable ({e}), recreating it", path.display());
                remove_database_files(&path).await?;
                (PrimaryStore::new(&path, config.quota_bytes).await?, true)
            }
            Err(e) => return Err(e),
        };

        info!("Opened store at {}", path.display());
        Self::assemble(config, remote, transform, store, recovered).await
    }

    /// Open the engine on an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns a configuration or store error.
    pub async fn in_memory(config: EngineConfig, remote: Arc<R>) -> Result<Self> {
        config.validate()?;
        let store = PrimaryStore::in_memory(config.quota_bytes).await?;
        Self::assemble(config, remote, Arc::new(IdentityTransform), store, false).await
    }

    async fn assemble(
        config: EngineConfig,
        remote: Arc<R>,
        transform: Arc<dyn BodyTransform>,
        store: PrimaryStore,
        recovered: bool,
    ) -> Result<Self> {
        let (store, store_task) = spawn_store(store, config.unit_timeout);
        let evictor = EvictionManager::new(store.clone(), config.high_watermark, config.low_watermark);
        let (indexer, indexer_task) = spawn_indexer(
            store.clone(),
            evictor.clone(),
            config.index_mode,
            config.unit_timeout,
        );
        let pipeline = Arc::new(SyncPipeline::new(
            Arc::clone(&remote),
            store.clone(),
            indexer.clone(),
            evictor.clone(),
            transform,
            &config,
        ));
        let (orchestrator, orchestrator_task) = spawn_orchestrator(
            Arc::clone(&pipeline),
            config.sync_interval,
            config.unit_timeout,
            config.task_timeout(),
        );
        let queue = MutationQueue::new(remote, store.clone(), &config);

        let engine = Self {
            config,
            store,
            indexer,
            orchestrator,
            pipeline,
            queue,
            evictor,
            units: vec![
                ("store", store_task),
                ("indexer", indexer_task),
                ("orchestrator", orchestrator_task),
            ],
            background: Vec::new(),
            watched: Mutex::new(BTreeSet::new()),
            recovered,
        };
        engine.check_indexes().await?;
        Ok(engine)
    }

    /// Compare every stored account's index watermark with the store.
    async fn check_indexes(&self) -> Result<()> {
        for account in self.store.accounts().await? {
            match self.indexer.health_check(account).await {
                Ok(IndexHealth::Healthy) => debug!("Index for account {account} is healthy"),
                Ok(health) => info!("Index for account {account}: {health:?}"),
                Err(e) => warn!("Index health check for account {account} failed: {e}"),
            }
        }
        Ok(())
    }

    fn watched_lock(&self) -> MutexGuard<'_, BTreeSet<AccountId>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settings the engine was opened with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns true if the store was recreated at open.
    #[must_use]
    pub const fn was_recovered(&self) -> bool {
        self.recovered
    }

    /// Store unit handle.
    #[must_use]
    pub const fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Indexer unit handle.
    #[must_use]
    pub const fn indexer(&self) -> &IndexerHandle {
        &self.indexer
    }

    /// Orchestrator unit handle.
    #[must_use]
    pub const fn orchestrator(&self) -> &OrchestratorHandle {
        &self.orchestrator
    }

    /// The outbox.
    #[must_use]
    pub const fn outbox(&self) -> &MutationQueue<R> {
        &self.queue
    }

    /// The eviction manager.
    #[must_use]
    pub const fn evictor(&self) -> &EvictionManager {
        &self.evictor
    }

    /// Include an account in background syncs.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the orchestrator is unreachable.
    pub async fn watch(&self, account: AccountId) -> Result<()> {
        self.orchestrator.watch(account).await?;
        self.watched_lock().insert(account);
        Ok(())
    }

    /// Drop an account from background syncs.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the orchestrator is unreachable.
    pub async fn unwatch(&self, account: AccountId) -> Result<()> {
        self.orchestrator.unwatch(account).await?;
        self.watched_lock().remove(&account);
        Ok(())
    }

    /// Watched accounts.
    #[must_use]
    pub fn watched(&self) -> Vec<AccountId> {
        self.watched_lock().iter().copied().collect()
    }

    /// Create a cache front for an account.
    #[must_use]
    pub fn front(&self, account: AccountId) -> CacheFront<R> {
        CacheFront::new(
            account,
            self.store.clone(),
            RefreshPolicy::new(self.orchestrator.clone(), Arc::clone(&self.pipeline)),
            self.queue.clone(),
            &self.config,
        )
    }

    /// Search an account's index.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the indexer is unreachable.
    pub async fn search(&self, account: AccountId, query: SearchQuery) -> Result<Vec<SearchHit>> {
        self.indexer.search(account, query).await
    }

    /// Sync every folder of an account now.
    ///
    /// # Errors
    ///
    /// Returns the sync error.
    pub async fn sync_account(&self, account: AccountId) -> Result<SyncSummary> {
        self.orchestrator.sync_account(account).await
    }

    /// Start the outbox and eviction loops. Calling it twice does nothing.
    pub fn start_background(&mut self) {
        if !self.background.is_empty() {
            return;
        }
        self.background
            .push(tokio::spawn(self.queue.clone().run(self.config.sync_interval)));
        self.background
            .push(tokio::spawn(self.evictor.clone().run(self.config.eviction_interval)));
        info!("Started outbox and eviction loops");
    }

    /// Wipe all persisted state and resync watched accounts from scratch.
    ///
    /// Queued writes are dropped with the rest of the store. Existing cache
    /// fronts should be torn down.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or indexer cannot be reset.
    pub async fn recover(&self) -> Result<()> {
        warn!("Recovering: wiping store and indexes");
        self.store.wipe().await?;
        self.indexer.reset_all().await?;

        for account in self.watched() {
            match self.orchestrator.sync_account(account).await {
                Ok(summary) => info!(
                    "Resynced account {account}: {} folders, {} messages",
                    summary.folders, summary.merged
                ),
                Err(e) => warn!("Resync of account {account} failed: {e}"),
            }
        }
        Ok(())
    }

    /// Stop background loops and units.
    pub async fn shutdown(self) {
        for task in self.background {
            task.abort();
            let _ = task.await;
        }
        for (name, task) in self.units.into_iter().rev() {
            task.abort();
            let _ = task.await;
            debug!("Stopped {name} unit");
        }
        info!("Engine stopped");
    }
}

/// Delete a database file with its WAL and shared-memory companions.
async fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        match tokio::fs::remove_file(PathBuf::from(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
