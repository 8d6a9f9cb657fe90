//! Store unit: the only task that touches the database.

use std::time::Duration;

use mailledger_remote::{AccountId, Cursor, MessageId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::model::{
    EnqueueOutcome, EvictionClass, Filter, Folder, IndexMeta, IndexPayload, Key, MessageBody,
    MessageDelta, MessageRecord, MutationEntry, MutationOp, MutationTarget, PruneWindow, Query,
    Record, Resolution, SortOrder, StorageUsage, SyncManifest, Table,
};
use super::repository::PrimaryStore;
use crate::protocol::{PendingReply, Request, Response, UnitClient};
use crate::{Error, Result};

/// Operations served by the store unit.
#[derive(Debug, Clone)]
pub enum StoreAction {
    /// Read one record.
    Get(Key),
    /// Read every record of a table matching a filter.
    GetAll(Table, Filter),
    /// Upsert one record.
    Put(Record),
    /// Upsert records atomically.
    BulkPut(Vec<Record>),
    /// Delete one record.
    Delete(Key),
    /// Delete records atomically.
    BulkDelete(Vec<Key>),
    /// Index-backed range query.
    Query(Query),
    /// Count records of a table matching a filter.
    Count(Table, Filter),
    /// Remove every record of a table.
    Clear(Table),
    /// Drop everything and recreate the schema.
    Wipe,
    /// Payload bytes per class.
    Usage,
    /// Merge delta records onto stored ones.
    MergeMessages(Vec<MessageDelta>),
    /// Remove stale messages after a full-resync page.
    PruneFolder {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
        /// Ids the server returned.
        keep: Vec<MessageId>,
        /// Range the page covers.
        window: PruneWindow,
    },
    /// Compare-and-set a folder cursor.
    AdvanceManifest {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
        /// Cursor the caller started from.
        expected: Option<Cursor>,
        /// New cursor.
        next: Cursor,
        /// Pages fetched since `expected`.
        pages: u64,
    },
    /// Forget a folder cursor.
    ResetManifest {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
    },
    /// Append to the outbox and apply optimistically.
    EnqueueMutation {
        /// Account.
        account: AccountId,
        /// Addressed entity.
        target: MutationTarget,
        /// Operation.
        op: MutationOp,
    },
    /// Remove a delivered outbox entry.
    CompleteMutation {
        /// Account.
        account: AccountId,
        /// Entry sequence.
        seq: u64,
    },
    /// Record a failed delivery attempt.
    FailMutation {
        /// Account.
        account: AccountId,
        /// Entry sequence.
        seq: u64,
        /// Error text.
        error: String,
        /// Mark the entry failed.
        permanent: bool,
    },
    /// Retry or discard an outbox entry.
    ResolveMutation {
        /// Account.
        account: AccountId,
        /// Entry sequence.
        seq: u64,
        /// Resolution.
        resolution: Resolution,
    },
    /// Free bytes from one payload class.
    Evict {
        /// Class to evict from.
        class: EvictionClass,
        /// Bytes to free.
        bytes: u64,
        /// Restrict to one account.
        account: Option<AccountId>,
    },
    /// Accounts with stored data.
    Accounts,
    /// Accounts with unresolved outbox entries.
    OutboxAccounts,
}

impl StoreAction {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::GetAll(..) => "get_all",
            Self::Put(_) => "put",
            Self::BulkPut(_) => "bulk_put",
            Self::Delete(_) => "delete",
            Self::BulkDelete(_) => "bulk_delete",
            Self::Query(_) => "query",
            Self::Count(..) => "count",
            Self::Clear(_) => "clear",
            Self::Wipe => "wipe",
            Self::Usage => "usage",
            Self::MergeMessages(_) => "merge_messages",
            Self::PruneFolder { .. } => "prune_folder",
            Self::AdvanceManifest { .. } => "advance_manifest",
            Self::ResetManifest { .. } => "reset_manifest",
            Self::EnqueueMutation { .. } => "enqueue_mutation",
            Self::CompleteMutation { .. } => "complete_mutation",
            Self::FailMutation { .. } => "fail_mutation",
            Self::ResolveMutation { .. } => "resolve_mutation",
            Self::Evict { .. } => "evict",
            Self::Accounts => "accounts",
            Self::OutboxAccounts => "outbox_accounts",
        }
    }
}

/// Store unit answers.
#[derive(Debug, Clone)]
pub enum StoreReply {
    /// Write completed.
    Done,
    /// Single lookup result.
    Record(Option<Record>),
    /// Multiple records.
    Records(Vec<Record>),
    /// Row count.
    Count(u64),
    /// Storage usage.
    Usage(StorageUsage),
    /// Merged message records.
    Messages(Vec<MessageRecord>),
    /// Message ids.
    Ids(Vec<MessageId>),
    /// Outbox append result.
    Enqueued(EnqueueOutcome),
    /// Yes/no outcome of a conditional write.
    Flag(bool),
    /// Bytes freed.
    Freed(u64),
    /// Account ids.
    Accounts(Vec<AccountId>),
}

async fn execute(store: &PrimaryStore, action: StoreAction) -> Result<StoreReply> {
    Ok(match action {
        StoreAction::Get(key) => StoreReply::Record(store.get(&key).await?),
        StoreAction::GetAll(table, filter) => {
            StoreReply::Records(store.get_all(table, &filter).await?)
        }
        StoreAction::Put(record) => {
            store.put(&record).await?;
            StoreReply::Done
        }
        StoreAction::BulkPut(records) => {
            store.bulk_put(&records).await?;
            StoreReply::Done
        }
        StoreAction::Delete(key) => StoreReply::Flag(store.delete(&key).await?),
        StoreAction::BulkDelete(keys) => StoreReply::Count(store.bulk_delete(&keys).await?),
        StoreAction::Query(query) => StoreReply::Records(store.query(&query).await?),
        StoreAction::Count(table, filter) => StoreReply::Count(store.count(table, &filter).await?),
        StoreAction::Clear(table) => {
            store.clear(table).await?;
            StoreReply::Done
        }
        StoreAction::Wipe => {
            store.wipe().await?;
            StoreReply::Done
        }
        StoreAction::Usage => StoreReply::Usage(store.usage().await?),
        StoreAction::MergeMessages(deltas) => {
            StoreReply::Messages(store.merge_messages(&deltas).await?)
        }
        StoreAction::PruneFolder {
            account,
            folder,
            keep,
            window,
        } => StoreReply::Ids(store.prune_folder(account, &folder, &keep, window).await?),
        StoreAction::AdvanceManifest {
            account,
            folder,
            expected,
            next,
            pages,
        } => StoreReply::Flag(
            store
                .advance_manifest(account, &folder, expected.as_ref(), &next, pages)
                .await?,
        ),
        StoreAction::ResetManifest { account, folder } => {
            store.reset_manifest(account, &folder).await?;
            StoreReply::Done
        }
        StoreAction::EnqueueMutation {
            account,
            target,
            op,
        } => StoreReply::Enqueued(store.enqueue_mutation(account, target, op).await?),
        StoreAction::CompleteMutation { account, seq } => {
            StoreReply::Flag(store.complete_mutation(account, seq).await?)
        }
        StoreAction::FailMutation {
            account,
            seq,
            error,
            permanent,
        } => {
            store.fail_mutation(account, seq, &error, permanent).await?;
            StoreReply::Done
        }
        StoreAction::ResolveMutation {
            account,
            seq,
            resolution,
        } => {
            store.resolve_mutation(account, seq, resolution).await?;
            StoreReply::Done
        }
        StoreAction::Evict {
            class,
            bytes,
            account,
        } => StoreReply::Freed(store.evict(class, bytes, account).await?),
        StoreAction::Accounts => StoreReply::Accounts(store.accounts().await?),
        StoreAction::OutboxAccounts => StoreReply::Accounts(store.outbox_accounts().await?),
    })
}

/// Start the store unit.
///
/// Requests are served one at a time in arrival order, which makes the unit
/// the single writer for the database.
#[must_use]
pub fn spawn_store(store: PrimaryStore, timeout: Duration) -> (StoreHandle, JoinHandle<()>) {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Request<StoreAction>>();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        while let Some(Request { id, action }) = request_rx.recv().await {
            let name = action.name();
            let result = execute(&store, action).await;
            match &result {
                Err(e @ Error::QuotaExceeded { .. }) => debug!("Store {name} rejected: {e}"),
                Err(e) => warn!("Store {name} failed: {e}"),
                Ok(_) => {}
            }
            if response_tx.send(Response { id, result }).is_err() {
                break;
            }
        }
        debug!("Store unit stopped");
    });

    let client = UnitClient::new("store", request_tx, response_rx, timeout);
    (StoreHandle { client }, task)
}

/// Typed client for the store unit.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    client: UnitClient<Request<StoreAction>, Response<StoreReply>>,
}

macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            StoreReply::$variant(value) => Ok(value),
            _ => Err(Error::UnexpectedReply("store")),
        }
    };
}

impl StoreHandle {
    /// Send an action without waiting.
    pub fn dispatch(&self, action: StoreAction) -> PendingReply<StoreReply> {
        self.client.dispatch_with(|id| Request { id, action })
    }

    async fn call(&self, action: StoreAction) -> Result<StoreReply> {
        self.dispatch(action).wait().await
    }

    async fn call_done(&self, action: StoreAction) -> Result<()> {
        match self.call(action).await? {
            StoreReply::Done => Ok(()),
            _ => Err(Error::UnexpectedReply("store")),
        }
    }

    /// Returns true while the unit is running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn get(&self, key: Key) -> Result<Option<Record>> {
        expect_reply!(self.call(StoreAction::Get(key)).await?, Record)
    }

    /// Read every record of a table matching a filter.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn get_all(&self, table: Table, filter: Filter) -> Result<Vec<Record>> {
        expect_reply!(self.call(StoreAction::GetAll(table, filter)).await?, Records)
    }

    /// Upsert one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if it does not fit.
    pub async fn put(&self, record: Record) -> Result<()> {
        self.call_done(StoreAction::Put(record)).await
    }

    /// Upsert records atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if the batch does not fit.
    pub async fn bulk_put(&self, records: Vec<Record>) -> Result<()> {
        self.call_done(StoreAction::BulkPut(records)).await
    }

    /// Delete one record. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn delete(&self, key: Key) -> Result<bool> {
        expect_reply!(self.call(StoreAction::Delete(key)).await?, Flag)
    }

    /// Delete records atomically.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn bulk_delete(&self, keys: Vec<Key>) -> Result<u64> {
        expect_reply!(self.call(StoreAction::BulkDelete(keys)).await?, Count)
    }

    /// Run an index-backed range query.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn query(&self, query: Query) -> Result<Vec<Record>> {
        expect_reply!(self.call(StoreAction::Query(query)).await?, Records)
    }

    /// Count records.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn count(&self, table: Table, filter: Filter) -> Result<u64> {
        expect_reply!(self.call(StoreAction::Count(table, filter)).await?, Count)
    }

    /// Remove every record of a table.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn clear(&self, table: Table) -> Result<()> {
        self.call_done(StoreAction::Clear(table)).await
    }

    /// Drop everything and recreate the schema.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn wipe(&self) -> Result<()> {
        self.call_done(StoreAction::Wipe).await
    }

    /// Payload bytes per class.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn usage(&self) -> Result<StorageUsage> {
        expect_reply!(self.call(StoreAction::Usage).await?, Usage)
    }

    /// Merge delta records onto stored ones.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn merge_messages(&self, deltas: Vec<MessageDelta>) -> Result<Vec<MessageRecord>> {
        expect_reply!(self.call(StoreAction::MergeMessages(deltas)).await?, Messages)
    }

    /// Remove messages a full-resync page did not return.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn prune_folder(
        &self,
        account: AccountId,
        folder: &str,
        keep: Vec<MessageId>,
        window: PruneWindow,
    ) -> Result<Vec<MessageId>> {
        let action = StoreAction::PruneFolder {
            account,
            folder: folder.to_string(),
            keep,
            window,
        };
        expect_reply!(self.call(action).await?, Ids)
    }

    /// Compare-and-set a folder cursor. Returns false if it moved meanwhile.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn advance_manifest(
        &self,
        account: AccountId,
        folder: &str,
        expected: Option<Cursor>,
        next: Cursor,
        pages: u64,
    ) -> Result<bool> {
        let action = StoreAction::AdvanceManifest {
            account,
            folder: folder.to_string(),
            expected,
            next,
            pages,
        };
        expect_reply!(self.call(action).await?, Flag)
    }

    /// Forget a folder cursor.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn reset_manifest(&self, account: AccountId, folder: &str) -> Result<()> {
        self.call_done(StoreAction::ResetManifest {
            account,
            folder: folder.to_string(),
        })
        .await
    }

    /// Append to the outbox and apply optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWrite`] for mismatched targets, or the store error.
    pub async fn enqueue_mutation(
        &self,
        account: AccountId,
        target: MutationTarget,
        op: MutationOp,
    ) -> Result<EnqueueOutcome> {
        let action = StoreAction::EnqueueMutation {
            account,
            target,
            op,
        };
        expect_reply!(self.call(action).await?, Enqueued)
    }

    /// Remove a delivered outbox entry.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn complete_mutation(&self, account: AccountId, seq: u64) -> Result<bool> {
        expect_reply!(
            self.call(StoreAction::CompleteMutation { account, seq }).await?,
            Flag
        )
    }

    /// Record a failed delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry is gone.
    pub async fn fail_mutation(
        &self,
        account: AccountId,
        seq: u64,
        error: String,
        permanent: bool,
    ) -> Result<()> {
        self.call_done(StoreAction::FailMutation {
            account,
            seq,
            error,
            permanent,
        })
        .await
    }

    /// Retry or discard an outbox entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry is gone.
    pub async fn resolve_mutation(
        &self,
        account: AccountId,
        seq: u64,
        resolution: Resolution,
    ) -> Result<()> {
        self.call_done(StoreAction::ResolveMutation {
            account,
            seq,
            resolution,
        })
        .await
    }

    /// Free bytes from one payload class. Returns bytes freed.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn evict(
        &self,
        class: EvictionClass,
        bytes: u64,
        account: Option<AccountId>,
    ) -> Result<u64> {
        let action = StoreAction::Evict {
            class,
            bytes,
            account,
        };
        expect_reply!(self.call(action).await?, Freed)
    }

    /// Accounts with stored data.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn accounts(&self) -> Result<Vec<AccountId>> {
        expect_reply!(self.call(StoreAction::Accounts).await?, Accounts)
    }

    /// Accounts with unresolved outbox entries.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn outbox_accounts(&self) -> Result<Vec<AccountId>> {
        expect_reply!(self.call(StoreAction::OutboxAccounts).await?, Accounts)
    }

    // Typed conveniences over get/query.

    /// Message metadata.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn message(&self, account: AccountId, id: &MessageId) -> Result<Option<MessageRecord>> {
        match self.get(Key::Message(account, id.clone())).await? {
            Some(Record::Message(record)) => Ok(Some(record)),
            None => Ok(None),
            Some(_) => Err(Error::UnexpectedReply("store")),
        }
    }

    /// Cached message body.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn body(&self, account: AccountId, id: &MessageId) -> Result<Option<MessageBody>> {
        match self.get(Key::Body(account, id.clone())).await? {
            Some(Record::Body(body)) => Ok(Some(body)),
            None => Ok(None),
            Some(_) => Err(Error::UnexpectedReply("store")),
        }
    }

    /// Sync manifest of a folder.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn manifest(&self, account: AccountId, folder: &str) -> Result<Option<SyncManifest>> {
        match self.get(Key::Manifest(account, folder.to_string())).await? {
            Some(Record::Manifest(manifest)) => Ok(Some(manifest)),
            None => Ok(None),
            Some(_) => Err(Error::UnexpectedReply("store")),
        }
    }

    /// Persisted index snapshot.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn index_payload(&self, account: AccountId) -> Result<Option<IndexPayload>> {
        match self.get(Key::IndexPayload(account)).await? {
            Some(Record::IndexPayload(payload)) => Ok(Some(payload)),
            None => Ok(None),
            Some(_) => Err(Error::UnexpectedReply("store")),
        }
    }

    /// Persisted index watermark.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn index_meta(&self, account: AccountId) -> Result<Option<IndexMeta>> {
        match self.get(Key::IndexMeta(account)).await? {
            Some(Record::IndexMeta(meta)) => Ok(Some(meta)),
            None => Ok(None),
            Some(_) => Err(Error::UnexpectedReply("store")),
        }
    }

    /// One page of a folder listing.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn folder_page(
        &self,
        account: AccountId,
        folder: &str,
        sort: SortOrder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let records = self
            .query(Query::FolderMessages {
                account,
                folder: folder.to_string(),
                sort,
                offset,
                limit,
            })
            .await?;
        Ok(messages(records))
    }

    /// Every stored message of an account.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn messages(&self, account: AccountId) -> Result<Vec<MessageRecord>> {
        let records = self
            .get_all(Table::Messages, Filter::account(account))
            .await?;
        Ok(messages(records))
    }

    /// Folders of an account.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn folders(&self, account: AccountId) -> Result<Vec<Folder>> {
        let records = self.get_all(Table::Folders, Filter::account(account)).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record {
                Record::Folder(folder) => Some(folder),
                _ => None,
            })
            .collect())
    }

    /// Number of stored messages of an account.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn message_count(&self, account: AccountId) -> Result<u64> {
        self.count(Table::Messages, Filter::account(account)).await
    }

    /// Unresolved outbox entries of an account, by sequence.
    ///
    /// # Errors
    ///
    /// Returns the store error, or a protocol error if the unit is unreachable.
    pub async fn mutations(&self, account: AccountId) -> Result<Vec<MutationEntry>> {
        let records = self.query(Query::Mutations { account }).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record {
                Record::Mutation(entry) => Some(entry),
                _ => None,
            })
            .collect())
    }
}

fn messages(records: Vec<Record>) -> Vec<MessageRecord> {
    records
        .into_iter()
        .filter_map(|record| match record {
            Record::Message(message) => Some(message),
            _ => None,
        })
        .collect()
}
