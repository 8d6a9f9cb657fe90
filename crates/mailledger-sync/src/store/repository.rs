//! `SQLite`-backed primary store.
//!
//! Every write runs in a transaction. Writes that touch payload tables (bodies,
//! index snapshots, aux entries) are checked against the quota before commit and
//! roll back with [`Error::QuotaExceeded`] if they would exceed it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use mailledger_remote::{AccountId, Cursor, MessageId};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::model::{
    AuxNamespace, CacheEntry, EnqueueOutcome, EntryStatus, EvictionClass, Filter, Folder,
    IndexMeta, IndexPayload, Key, MessageBody, MessageDelta, MessageFlags, MessageRecord,
    MutationEntry, MutationOp, MutationTarget, PruneWindow, Query, Record, Resolution,
    SortOrder, StorageUsage, SyncManifest, Table,
};
use crate::{Error, Result};

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS messages (
        account_id INTEGER NOT NULL,
        id TEXT NOT NULL,
        folder TEXT NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        from_name TEXT NOT NULL DEFAULT '',
        from_email TEXT NOT NULL DEFAULT '',
        to_json TEXT NOT NULL DEFAULT '[]',
        date TEXT NOT NULL,
        seen INTEGER NOT NULL DEFAULT 0,
        flagged INTEGER NOT NULL DEFAULT 0,
        answered INTEGER NOT NULL DEFAULT 0,
        labels_json TEXT NOT NULL DEFAULT '[]',
        snippet TEXT NOT NULL DEFAULT '',
        thread_id TEXT,
        in_reply_to TEXT,
        has_attachments INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account_id, id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_messages_folder_date
    ON messages(account_id, folder, date)
    ",
    r"
    CREATE TABLE IF NOT EXISTS bodies (
        account_id INTEGER NOT NULL,
        id TEXT NOT NULL,
        text TEXT,
        html TEXT,
        attachments_json TEXT NOT NULL DEFAULT '[]',
        size_bytes INTEGER NOT NULL,
        cached_at TEXT NOT NULL,
        PRIMARY KEY (account_id, id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS folders (
        account_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        name TEXT NOT NULL,
        folder_type TEXT NOT NULL,
        unread_count INTEGER NOT NULL DEFAULT 0,
        total_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account_id, path)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS manifests (
        account_id INTEGER NOT NULL,
        folder TEXT NOT NULL,
        cursor TEXT,
        last_sync_at TEXT,
        pages_fetched INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account_id, folder)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS outbox (
        account_id INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        target_key TEXT NOT NULL,
        target_json TEXT NOT NULL,
        op_kind TEXT NOT NULL,
        op_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        PRIMARY KEY (account_id, seq)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_target
    ON outbox(account_id, target_key)
    ",
    r"
    CREATE TABLE IF NOT EXISTS outbox_sequences (
        account_id INTEGER PRIMARY KEY,
        last_seq INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS index_payloads (
        account_id INTEGER PRIMARY KEY,
        payload TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        cached_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS index_meta (
        account_id INTEGER PRIMARY KEY,
        count INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS aux_entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        owner_account INTEGER,
        owner_message TEXT,
        size_bytes INTEGER NOT NULL,
        cached_at TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )
    ",
];

const DROP_ALL: &[&str] = &[
    "DROP TABLE IF EXISTS messages",
    "DROP TABLE IF EXISTS bodies",
    "DROP TABLE IF EXISTS folders",
    "DROP TABLE IF EXISTS manifests",
    "DROP TABLE IF EXISTS outbox",
    "DROP TABLE IF EXISTS outbox_sequences",
    "DROP TABLE IF EXISTS index_payloads",
    "DROP TABLE IF EXISTS index_meta",
    "DROP TABLE IF EXISTS aux_entries",
];

/// Sole owner of persisted engine state.
#[derive(Debug, Clone)]
pub struct PrimaryStore {
    pool: SqlitePool,
    quota_bytes: u64,
}

impl PrimaryStore {
    /// Open (or create) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreVersionMismatch`] or [`Error::StoreCorruption`] if the
    /// existing file cannot be used, or an error if the connection fails.
    pub async fn new(database_path: &Path, quota_bytes: u64) -> Result<Self> {
        if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = format!("sqlite:{}?mode=rwc", database_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool, quota_bytes };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(quota_bytes: u64) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool, quota_bytes };
        store.initialize().await?;
        Ok(store)
    }

    /// Check the schema version and integrity, creating the schema on a fresh file.
    async fn initialize(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let version: i64 = sqlx::query("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;
        let tables: i64 = sqlx::query(r"SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;

        if version == 0 && tables == 0 {
            create_schema(&mut conn).await?;
            info!("Created store schema version {SCHEMA_VERSION}");
        } else if version != SCHEMA_VERSION {
            return Err(Error::StoreVersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        let check: String = sqlx::query("PRAGMA quick_check")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;
        if check != "ok" {
            return Err(Error::StoreCorruption(check));
        }

        Ok(())
    }

    /// Configured payload quota in bytes.
    #[must_use]
    pub const fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Get a record by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, key: &Key) -> Result<Option<Record>> {
        let mut conn = self.pool.acquire().await?;
        select_record(&mut conn, key).await
    }

    /// Get all records of a table matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_all(&self, table: Table, filter: &Filter) -> Result<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;
        let mut query = filtered(&format!("SELECT * FROM {}", table_name(table)), table, filter);
        query.push(order_clause(table));
        let rows = query.build().fetch_all(&mut *conn).await?;
        rows.iter().map(|row| record_from_row(table, row)).collect()
    }

    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if the write does not fit, or
    /// [`Error::InvalidWrite`] for outbox entries.
    pub async fn put(&self, record: &Record) -> Result<()> {
        self.bulk_put(std::slice::from_ref(record)).await
    }

    /// Insert or replace records atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if the batch does not fit (nothing is
    /// written), or [`Error::InvalidWrite`] for outbox entries.
    pub async fn bulk_put(&self, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let before = payload_usage(&mut tx).await?.total();
        for record in records {
            write_record(&mut tx, record).await?;
        }
        self.enforce_quota(&mut tx, before).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a record. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, key: &Key) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(delete_record(&mut conn, key).await? > 0)
    }

    /// Delete records atomically. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn bulk_delete(&self, keys: &[Key]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for key in keys {
            removed += delete_record(&mut tx, key).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Run an index-backed range query.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn query(&self, query: &Query) -> Result<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;
        match query {
            Query::FolderMessages {
                account,
                folder,
                sort,
                offset,
                limit,
            } => {
                let order = match sort {
                    SortOrder::DateDesc => "ORDER BY date DESC, id DESC",
                    SortOrder::DateAsc => "ORDER BY date ASC, id ASC",
                };
                let sql = format!(
                    "SELECT * FROM messages WHERE account_id = ? AND folder = ? {order} LIMIT ? OFFSET ?"
                );
                let rows = sqlx::query(&sql)
                    .bind(account.0)
                    .bind(folder)
                    .bind(i64::from(*limit))
                    .bind(i64::from(*offset))
                    .fetch_all(&mut *conn)
                    .await?;
                rows.iter()
                    .map(|row| message_from_row(row).map(Record::Message))
                    .collect()
            }
            Query::Mutations { account } => Ok(select_mutations(&mut conn, *account)
                .await?
                .into_iter()
                .map(Record::Mutation)
                .collect()),
            Query::AuxByNamespace { namespace } => {
                let rows = sqlx::query(
                    r"SELECT * FROM aux_entries WHERE namespace = ? ORDER BY cached_at ASC, key ASC",
                )
                .bind(namespace.as_str())
                .fetch_all(&mut *conn)
                .await?;
                rows.iter()
                    .map(|row| aux_from_row(row).map(Record::Aux))
                    .collect()
            }
        }
    }

    /// Count records of a table matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self, table: Table, filter: &Filter) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let mut query = filtered(
            &format!("SELECT COUNT(*) FROM {}", table_name(table)),
            table,
            filter,
        );
        let count: i64 = query.build().fetch_one(&mut *conn).await?.try_get(0)?;
        Ok(to_u64(count))
    }

    /// Remove every record of a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear(&self, table: Table) -> Result<()> {
        let sql = format!("DELETE FROM {}", table_name(table));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop all state and recreate the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn wipe(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in DROP_ALL {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        create_schema(&mut tx).await?;
        tx.commit().await?;
        info!("Store wiped and schema recreated");
        Ok(())
    }

    /// Payload bytes per class.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn usage(&self) -> Result<StorageUsage> {
        let mut conn = self.pool.acquire().await?;
        let mut usage = payload_usage(&mut conn).await?;
        usage.quota = self.quota_bytes;
        Ok(usage)
    }

    /// Merge delta records onto stored ones.
    ///
    /// Missing fields keep their stored values. Unresolved outbox operations
    /// are re-applied on top so optimistic local state survives a sync; messages
    /// with a pending delete are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn merge_messages(&self, deltas: &[MessageDelta]) -> Result<Vec<MessageRecord>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut outbox: HashMap<AccountId, Vec<MutationEntry>> = HashMap::new();
        let mut merged = Vec::with_capacity(deltas.len());

        for delta in deltas {
            if !outbox.contains_key(&delta.account_id) {
                let entries = select_mutations(&mut tx, delta.account_id).await?;
                outbox.insert(delta.account_id, entries);
            }
            let pending: Vec<&MutationOp> = outbox
                .get(&delta.account_id)
                .into_iter()
                .flatten()
                .filter(|entry| entry.target.message_id() == Some(&delta.id))
                .map(|entry| &entry.op)
                .collect();
            if pending.iter().any(|op| matches!(op, MutationOp::Delete)) {
                debug!("Skipping {} with a pending delete", delta.id);
                continue;
            }

            let existing = select_message(&mut tx, delta.account_id, &delta.id).await?;
            let mut record = delta.merge_onto(existing.as_ref(), now);
            for op in pending {
                record.apply(op);
            }
            write_message(&mut tx, &record).await?;
            merged.push(record);
        }

        tx.commit().await?;
        Ok(merged)
    }

    /// Delete stored messages of a folder that a full-resync page did not return.
    ///
    /// Only messages inside `window` are considered, and messages with an
    /// unresolved delete or move are kept. Bodies of pruned messages go too.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn prune_folder(
        &self,
        account: AccountId,
        folder: &str,
        keep: &[MessageId],
        window: PruneWindow,
    ) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;

        let rows = match window {
            PruneWindow::Entire => {
                sqlx::query(r"SELECT id FROM messages WHERE account_id = ? AND folder = ?")
                    .bind(account.0)
                    .bind(folder)
                    .fetch_all(&mut *tx)
                    .await?
            }
            PruneWindow::NewerThan(oldest) => {
                sqlx::query(
                    r"SELECT id FROM messages WHERE account_id = ? AND folder = ? AND date > ?",
                )
                .bind(account.0)
                .bind(folder)
                .bind(timestamp(&oldest))
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let keep: HashSet<&MessageId> = keep.iter().collect();
        let protected: HashSet<MessageId> = select_mutations(&mut tx, account)
            .await?
            .into_iter()
            .filter(|entry| entry.op.removes_from_folder())
            .filter_map(|entry| entry.target.message_id().cloned())
            .collect();

        let mut pruned = Vec::new();
        for row in &rows {
            let id = MessageId(row.try_get("id")?);
            if keep.contains(&id) || protected.contains(&id) {
                continue;
            }
            delete_record(&mut tx, &Key::Message(account, id.clone())).await?;
            delete_record(&mut tx, &Key::Body(account, id.clone())).await?;
            pruned.push(id);
        }

        tx.commit().await?;
        Ok(pruned)
    }

    /// Replace a folder's cursor if it still equals `expected`.
    ///
    /// Returns false (and writes nothing) if another sync moved it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn advance_manifest(
        &self,
        account: AccountId,
        folder: &str,
        expected: Option<&Cursor>,
        next: &Cursor,
        pages: u64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let current = select_manifest(&mut tx, account, folder).await?;
        if current.as_ref().and_then(|m| m.cursor.as_ref()) != expected {
            return Ok(false);
        }

        let manifest = SyncManifest {
            account_id: account,
            folder: folder.to_string(),
            cursor: Some(next.clone()),
            last_sync_at: Some(Utc::now()),
            pages_fetched: current.map_or(0, |m| m.pages_fetched) + pages,
        };
        write_manifest(&mut tx, &manifest).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Forget a folder's cursor so the next fetch is a full resync.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn reset_manifest(&self, account: AccountId, folder: &str) -> Result<()> {
        sqlx::query(r"UPDATE manifests SET cursor = NULL WHERE account_id = ? AND folder = ?")
            .bind(account.0)
            .bind(folder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append an outbox entry and apply it to the local record, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWrite`] if the operation does not fit the target,
    /// or an error if the database query fails.
    pub async fn enqueue_mutation(
        &self,
        account: AccountId,
        target: MutationTarget,
        op: MutationOp,
    ) -> Result<EnqueueOutcome> {
        if !op.fits(&target) {
            return Err(Error::InvalidWrite(format!(
                "{} cannot address {}",
                op.kind(),
                target.key()
            )));
        }

        let mut tx = self.pool.begin().await?;
        let seq: i64 = sqlx::query(
            r"
            INSERT INTO outbox_sequences (account_id, last_seq) VALUES (?, 1)
            ON CONFLICT(account_id) DO UPDATE SET last_seq = last_seq + 1
            RETURNING last_seq
            ",
        )
        .bind(account.0)
        .fetch_one(&mut *tx)
        .await?
        .try_get("last_seq")?;

        let entry = MutationEntry {
            account_id: account,
            seq: to_u64(seq),
            target,
            op,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            status: EntryStatus::Pending,
        };
        sqlx::query(
            r"
            INSERT INTO outbox
                (account_id, seq, target_key, target_json, op_kind, op_json, created_at,
                 attempts, last_error, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)
            ",
        )
        .bind(account.0)
        .bind(seq)
        .bind(entry.target.key())
        .bind(serde_json::to_string(&entry.target)?)
        .bind(entry.op.kind())
        .bind(serde_json::to_string(&entry.op)?)
        .bind(timestamp(&entry.created_at))
        .bind(entry.status.as_str())
        .execute(&mut *tx)
        .await?;

        let mut record = None;
        let mut affected_folders = Vec::new();
        if let Some(id) = entry.target.message_id()
            && let Some(mut stored) = select_message(&mut tx, account, id).await?
        {
            affected_folders.push(stored.folder.clone());
            if matches!(entry.op, MutationOp::Delete) {
                delete_record(&mut tx, &Key::Message(account, id.clone())).await?;
                delete_record(&mut tx, &Key::Body(account, id.clone())).await?;
            } else {
                stored.apply(&entry.op);
                write_message(&mut tx, &stored).await?;
                if !affected_folders.contains(&stored.folder) {
                    affected_folders.push(stored.folder.clone());
                }
                record = Some(stored);
            }
        }

        tx.commit().await?;
        Ok(EnqueueOutcome {
            entry,
            record,
            affected_folders,
        })
    }

    /// Remove a delivered outbox entry. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn complete_mutation(&self, account: AccountId, seq: u64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(delete_record(&mut conn, &Key::Mutation(account, seq)).await? > 0)
    }

    /// Record a failed delivery attempt. Permanent failures mark the entry failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn fail_mutation(
        &self,
        account: AccountId,
        seq: u64,
        error: &str,
        permanent: bool,
    ) -> Result<()> {
        let status = if permanent {
            EntryStatus::Failed.as_str()
        } else {
            EntryStatus::Pending.as_str()
        };
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = ?, status = ?
            WHERE account_id = ? AND seq = ?
            ",
        )
        .bind(error)
        .bind(status)
        .bind(account.0)
        .bind(to_i64(seq))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("outbox entry {account}/{seq}")));
        }
        Ok(())
    }

    /// Resolve an outbox entry: put it back in line or drop it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn resolve_mutation(
        &self,
        account: AccountId,
        seq: u64,
        resolution: Resolution,
    ) -> Result<()> {
        let result = match resolution {
            Resolution::Retry => {
                sqlx::query(
                    r"UPDATE outbox SET status = 'pending', attempts = 0 WHERE account_id = ? AND seq = ?",
                )
                .bind(account.0)
                .bind(to_i64(seq))
                .execute(&self.pool)
                .await?
            }
            Resolution::Discard => {
                sqlx::query(r"DELETE FROM outbox WHERE account_id = ? AND seq = ?")
                    .bind(account.0)
                    .bind(to_i64(seq))
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("outbox entry {account}/{seq}")));
        }
        Ok(())
    }

    /// Free at least `bytes` from one payload class, least recently cached first.
    ///
    /// Items belonging to messages with unresolved outbox entries are skipped.
    /// Returns the bytes actually freed, which may fall short.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn evict(
        &self,
        class: EvictionClass,
        bytes: u64,
        account: Option<AccountId>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let account = account.map(|a| a.0);

        let candidates: Vec<(Key, u64)> = match class {
            EvictionClass::AttachmentBlobs => sqlx::query(
                r"
                SELECT key, size_bytes FROM aux_entries a
                WHERE namespace = 'attachment_blob'
                  AND (? IS NULL OR owner_account = ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox o
                      WHERE o.account_id = a.owner_account
                        AND o.target_key = 'msg:' || a.owner_message
                  )
                ORDER BY cached_at ASC, key ASC
                ",
            )
            .bind(account)
            .bind(account)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| {
                Ok((
                    Key::Aux(AuxNamespace::AttachmentBlob, row.try_get("key")?),
                    to_u64(row.try_get("size_bytes")?),
                ))
            })
            .collect::<Result<_>>()?,
            EvictionClass::IndexPayloads => sqlx::query(
                r"
                SELECT account_id, size_bytes FROM index_payloads
                WHERE (? IS NULL OR account_id = ?)
                ORDER BY cached_at ASC
                ",
            )
            .bind(account)
            .bind(account)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| {
                Ok((
                    Key::IndexPayload(AccountId(row.try_get("account_id")?)),
                    to_u64(row.try_get("size_bytes")?),
                ))
            })
            .collect::<Result<_>>()?,
            EvictionClass::Bodies => sqlx::query(
                r"
                SELECT account_id, id, size_bytes FROM bodies b
                WHERE (? IS NULL OR account_id = ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox o
                      WHERE o.account_id = b.account_id AND o.target_key = 'msg:' || b.id
                  )
                ORDER BY cached_at ASC, id ASC
                ",
            )
            .bind(account)
            .bind(account)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| {
                Ok((
                    Key::Body(AccountId(row.try_get("account_id")?), MessageId(row.try_get("id")?)),
                    to_u64(row.try_get("size_bytes")?),
                ))
            })
            .collect::<Result<_>>()?,
        };

        let mut freed = 0;
        for (key, size) in candidates {
            if freed >= bytes {
                break;
            }
            delete_record(&mut tx, &key).await?;
            // A snapshot without its watermark forces a rebuild on the next health check.
            if let Key::IndexPayload(owner) = key {
                delete_record(&mut tx, &Key::IndexMeta(owner)).await?;
            }
            freed += size;
        }

        tx.commit().await?;
        Ok(freed)
    }

    /// Accounts with stored messages or folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn accounts(&self) -> Result<Vec<AccountId>> {
        let rows = sqlx::query(
            r"SELECT account_id FROM messages UNION SELECT account_id FROM folders ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(AccountId(row.try_get(0)?)))
            .collect()
    }

    /// Accounts with unresolved outbox entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn outbox_accounts(&self) -> Result<Vec<AccountId>> {
        let rows = sqlx::query(r"SELECT DISTINCT account_id FROM outbox ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(AccountId(row.try_get(0)?)))
            .collect()
    }

    async fn enforce_quota(&self, conn: &mut SqliteConnection, before: u64) -> Result<()> {
        let after = payload_usage(conn).await?.total();
        if after > self.quota_bytes && after > before {
            return Err(Error::QuotaExceeded {
                needed: after - self.quota_bytes,
                available: self.quota_bytes.saturating_sub(before),
            });
        }
        Ok(())
    }
}

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    let pragma = format!("PRAGMA user_version = {SCHEMA_VERSION}");
    sqlx::query(&pragma).execute(&mut *conn).await?;
    Ok(())
}

const fn table_name(table: Table) -> &'static str {
    match table {
        Table::Messages => "messages",
        Table::Bodies => "bodies",
        Table::Folders => "folders",
        Table::Manifests => "manifests",
        Table::Outbox => "outbox",
        Table::IndexPayloads => "index_payloads",
        Table::IndexMeta => "index_meta",
        Table::Aux => "aux_entries",
    }
}

const fn order_clause(table: Table) -> &'static str {
    match table {
        Table::Messages => " ORDER BY account_id, date DESC, id DESC",
        Table::Bodies => " ORDER BY account_id, id",
        Table::Folders => " ORDER BY account_id, path",
        Table::Manifests => " ORDER BY account_id, folder",
        Table::Outbox => " ORDER BY account_id, seq",
        Table::IndexPayloads | Table::IndexMeta => " ORDER BY account_id",
        Table::Aux => " ORDER BY cached_at, key",
    }
}

/// Build `base WHERE ...` from the filter fields that apply to the table.
fn filtered<'a>(base: &str, table: Table, filter: &Filter) -> QueryBuilder<'a, Sqlite> {
    let mut query = QueryBuilder::new(base);
    query.push(" WHERE 1 = 1");

    if let Some(account) = filter.account {
        let column = if table == Table::Aux {
            "owner_account"
        } else {
            "account_id"
        };
        query.push(format!(" AND {column} = ")).push_bind(account.0);
    }
    if let Some(folder) = &filter.folder {
        match table {
            Table::Messages | Table::Manifests => {
                query.push(" AND folder = ").push_bind(folder.clone());
            }
            Table::Folders => {
                query.push(" AND path = ").push_bind(folder.clone());
            }
            _ => {}
        }
    }
    if let (Some(namespace), Table::Aux) = (filter.namespace, table) {
        query.push(" AND namespace = ").push_bind(namespace.as_str());
    }
    query
}

async fn payload_usage(conn: &mut SqliteConnection) -> Result<StorageUsage> {
    let row = sqlx::query(
        r"
        SELECT
            (SELECT COALESCE(SUM(size_bytes), 0) FROM bodies) AS bodies,
            (SELECT COALESCE(SUM(size_bytes), 0) FROM index_payloads) AS index_payloads,
            (SELECT COALESCE(SUM(size_bytes), 0) FROM aux_entries
                WHERE namespace = 'attachment_blob') AS attachment_blobs,
            (SELECT COALESCE(SUM(size_bytes), 0) FROM aux_entries
                WHERE namespace != 'attachment_blob') AS other_aux
        ",
    )
    .fetch_one(&mut *conn)
    .await?;

    Ok(StorageUsage {
        bodies: to_u64(row.try_get("bodies")?),
        index_payloads: to_u64(row.try_get("index_payloads")?),
        attachment_blobs: to_u64(row.try_get("attachment_blobs")?),
        other_aux: to_u64(row.try_get("other_aux")?),
        quota: 0,
    })
}

async fn select_record(conn: &mut SqliteConnection, key: &Key) -> Result<Option<Record>> {
    Ok(match key {
        Key::Message(account, id) => select_message(conn, *account, id).await?.map(Record::Message),
        Key::Manifest(account, folder) => select_manifest(conn, *account, folder)
            .await?
            .map(Record::Manifest),
        _ => {
            let (sql, table) = match key {
                Key::Body(..) => (r"SELECT * FROM bodies WHERE account_id = ? AND id = ?", Table::Bodies),
                Key::Folder(..) => (r"SELECT * FROM folders WHERE account_id = ? AND path = ?", Table::Folders),
                Key::Mutation(..) => (r"SELECT * FROM outbox WHERE account_id = ? AND seq = ?", Table::Outbox),
                Key::IndexPayload(_) => (r"SELECT * FROM index_payloads WHERE account_id = ?", Table::IndexPayloads),
                Key::IndexMeta(_) => (r"SELECT * FROM index_meta WHERE account_id = ?", Table::IndexMeta),
                Key::Aux(..) | Key::Message(..) | Key::Manifest(..) => {
                    (r"SELECT * FROM aux_entries WHERE namespace = ? AND key = ?", Table::Aux)
                }
            };
            let query = bind_key(sqlx::query(sql), key);
            match query.fetch_optional(&mut *conn).await? {
                Some(row) => Some(record_from_row(table, &row)?),
                None => None,
            }
        }
    })
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind the key columns in primary-key order.
fn bind_key<'q>(query: SqliteQuery<'q>, key: &Key) -> SqliteQuery<'q> {
    match key {
        Key::Message(account, id) | Key::Body(account, id) => {
            query.bind(account.0).bind(id.0.clone())
        }
        Key::Folder(account, path) | Key::Manifest(account, path) => {
            query.bind(account.0).bind(path.clone())
        }
        Key::Mutation(account, seq) => query.bind(account.0).bind(to_i64(*seq)),
        Key::IndexPayload(account) | Key::IndexMeta(account) => query.bind(account.0),
        Key::Aux(namespace, key) => query.bind(namespace.as_str()).bind(key.clone()),
    }
}

async fn delete_record(conn: &mut SqliteConnection, key: &Key) -> Result<u64> {
    let sql = match key {
        Key::Message(..) => r"DELETE FROM messages WHERE account_id = ? AND id = ?",
        Key::Body(..) => r"DELETE FROM bodies WHERE account_id = ? AND id = ?",
        Key::Folder(..) => r"DELETE FROM folders WHERE account_id = ? AND path = ?",
        Key::Manifest(..) => r"DELETE FROM manifests WHERE account_id = ? AND folder = ?",
        Key::Mutation(..) => r"DELETE FROM outbox WHERE account_id = ? AND seq = ?",
        Key::IndexPayload(_) => r"DELETE FROM index_payloads WHERE account_id = ?",
        Key::IndexMeta(_) => r"DELETE FROM index_meta WHERE account_id = ?",
        Key::Aux(..) => r"DELETE FROM aux_entries WHERE namespace = ? AND key = ?",
    };
    let result = bind_key(sqlx::query(sql), key).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn write_record(conn: &mut SqliteConnection, record: &Record) -> Result<()> {
    match record {
        Record::Message(message) => write_message(conn, message).await,
        Record::Body(body) => write_body(conn, body).await,
        Record::Folder(folder) => write_folder(conn, folder).await,
        Record::Manifest(manifest) => write_manifest(conn, manifest).await,
        Record::IndexPayload(payload) => write_index_payload(conn, payload).await,
        Record::IndexMeta(meta) => write_index_meta(conn, meta).await,
        Record::Aux(entry) => write_aux(conn, entry).await,
        Record::Mutation(entry) => Err(Error::InvalidWrite(format!(
            "outbox entry {}/{} must be appended through enqueue_mutation",
            entry.account_id, entry.seq
        ))),
    }
}

async fn select_message(
    conn: &mut SqliteConnection,
    account: AccountId,
    id: &MessageId,
) -> Result<Option<MessageRecord>> {
    let row = sqlx::query(r"SELECT * FROM messages WHERE account_id = ? AND id = ?")
        .bind(account.0)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

async fn write_message(conn: &mut SqliteConnection, message: &MessageRecord) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO messages
            (account_id, id, folder, subject, from_name, from_email, to_json, date,
             seen, flagged, answered, labels_json, snippet, thread_id, in_reply_to,
             has_attachments)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, id) DO UPDATE SET
            folder = excluded.folder,
            subject = excluded.subject,
            from_name = excluded.from_name,
            from_email = excluded.from_email,
            to_json = excluded.to_json,
            date = excluded.date,
            seen = excluded.seen,
            flagged = excluded.flagged,
            answered = excluded.answered,
            labels_json = excluded.labels_json,
            snippet = excluded.snippet,
            thread_id = excluded.thread_id,
            in_reply_to = excluded.in_reply_to,
            has_attachments = excluded.has_attachments
        ",
    )
    .bind(message.account_id.0)
    .bind(message.id.as_str())
    .bind(&message.folder)
    .bind(&message.subject)
    .bind(&message.from_name)
    .bind(&message.from_email)
    .bind(serde_json::to_string(&message.to)?)
    .bind(timestamp(&message.date))
    .bind(message.flags.seen)
    .bind(message.flags.flagged)
    .bind(message.flags.answered)
    .bind(serde_json::to_string(&message.labels)?)
    .bind(&message.snippet)
    .bind(&message.thread_id)
    .bind(&message.in_reply_to)
    .bind(message.has_attachments)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_body(conn: &mut SqliteConnection, body: &MessageBody) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO bodies (account_id, id, text, html, attachments_json, size_bytes, cached_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, id) DO UPDATE SET
            text = excluded.text,
            html = excluded.html,
            attachments_json = excluded.attachments_json,
            size_bytes = excluded.size_bytes,
            cached_at = excluded.cached_at
        ",
    )
    .bind(body.account_id.0)
    .bind(body.id.as_str())
    .bind(&body.text)
    .bind(&body.html)
    .bind(serde_json::to_string(&body.attachments)?)
    .bind(to_i64(body.size_bytes()))
    .bind(timestamp(&body.cached_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_folder(conn: &mut SqliteConnection, folder: &Folder) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO folders (account_id, path, name, folder_type, unread_count, total_count)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, path) DO UPDATE SET
            name = excluded.name,
            folder_type = excluded.folder_type,
            unread_count = excluded.unread_count,
            total_count = excluded.total_count
        ",
    )
    .bind(folder.account_id.0)
    .bind(&folder.path)
    .bind(&folder.name)
    .bind(serde_json::to_string(&folder.folder_type)?)
    .bind(folder.unread_count)
    .bind(folder.total_count)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn select_manifest(
    conn: &mut SqliteConnection,
    account: AccountId,
    folder: &str,
) -> Result<Option<SyncManifest>> {
    let row = sqlx::query(r"SELECT * FROM manifests WHERE account_id = ? AND folder = ?")
        .bind(account.0)
        .bind(folder)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(manifest_from_row).transpose()
}

async fn write_manifest(conn: &mut SqliteConnection, manifest: &SyncManifest) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO manifests (account_id, folder, cursor, last_sync_at, pages_fetched)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(account_id, folder) DO UPDATE SET
            cursor = excluded.cursor,
            last_sync_at = excluded.last_sync_at,
            pages_fetched = excluded.pages_fetched
        ",
    )
    .bind(manifest.account_id.0)
    .bind(&manifest.folder)
    .bind(manifest.cursor.as_ref().map(Cursor::as_str))
    .bind(manifest.last_sync_at.as_ref().map(timestamp))
    .bind(to_i64(manifest.pages_fetched))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn select_mutations(
    conn: &mut SqliteConnection,
    account: AccountId,
) -> Result<Vec<MutationEntry>> {
    let rows = sqlx::query(r"SELECT * FROM outbox WHERE account_id = ? ORDER BY seq ASC")
        .bind(account.0)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(mutation_from_row).collect()
}

async fn write_index_payload(conn: &mut SqliteConnection, payload: &IndexPayload) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO index_payloads (account_id, payload, size_bytes, cached_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            payload = excluded.payload,
            size_bytes = excluded.size_bytes,
            cached_at = excluded.cached_at
        ",
    )
    .bind(payload.account_id.0)
    .bind(&payload.payload)
    .bind(to_i64(payload.size_bytes()))
    .bind(timestamp(&payload.cached_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_index_meta(conn: &mut SqliteConnection, meta: &IndexMeta) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO index_meta (account_id, count, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            count = excluded.count,
            updated_at = excluded.updated_at
        ",
    )
    .bind(meta.account_id.0)
    .bind(to_i64(meta.count))
    .bind(timestamp(&meta.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_aux(conn: &mut SqliteConnection, entry: &CacheEntry) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO aux_entries
            (namespace, key, value, owner_account, owner_message, size_bytes, cached_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(namespace, key) DO UPDATE SET
            value = excluded.value,
            owner_account = excluded.owner_account,
            owner_message = excluded.owner_message,
            size_bytes = excluded.size_bytes,
            cached_at = excluded.cached_at
        ",
    )
    .bind(entry.namespace.as_str())
    .bind(&entry.key)
    .bind(&entry.value)
    .bind(entry.owner.as_ref().map(|(account, _)| account.0))
    .bind(entry.owner.as_ref().map(|(_, id)| id.0.clone()))
    .bind(to_i64(entry.size_bytes()))
    .bind(timestamp(&entry.cached_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn record_from_row(table: Table, row: &SqliteRow) -> Result<Record> {
    Ok(match table {
        Table::Messages => Record::Message(message_from_row(row)?),
        Table::Bodies => Record::Body(body_from_row(row)?),
        Table::Folders => Record::Folder(folder_from_row(row)?),
        Table::Manifests => Record::Manifest(manifest_from_row(row)?),
        Table::Outbox => Record::Mutation(mutation_from_row(row)?),
        Table::IndexPayloads => Record::IndexPayload(IndexPayload {
            account_id: AccountId(row.try_get("account_id")?),
            payload: row.try_get("payload")?,
            cached_at: parse_timestamp(row.try_get("cached_at")?)?,
        }),
        Table::IndexMeta => Record::IndexMeta(IndexMeta {
            account_id: AccountId(row.try_get("account_id")?),
            count: to_u64(row.try_get("count")?),
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        }),
        Table::Aux => Record::Aux(aux_from_row(row)?),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let labels: BTreeSet<String> = serde_json::from_str(row.try_get("labels_json")?)?;
    Ok(MessageRecord {
        account_id: AccountId(row.try_get("account_id")?),
        id: MessageId(row.try_get("id")?),
        folder: row.try_get("folder")?,
        subject: row.try_get("subject")?,
        from_name: row.try_get("from_name")?,
        from_email: row.try_get("from_email")?,
        to: serde_json::from_str(row.try_get("to_json")?)?,
        date: parse_timestamp(row.try_get("date")?)?,
        flags: MessageFlags {
            seen: row.try_get("seen")?,
            flagged: row.try_get("flagged")?,
            answered: row.try_get("answered")?,
        },
        labels,
        snippet: row.try_get("snippet")?,
        thread_id: row.try_get("thread_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        has_attachments: row.try_get("has_attachments")?,
    })
}

fn body_from_row(row: &SqliteRow) -> Result<MessageBody> {
    Ok(MessageBody {
        account_id: AccountId(row.try_get("account_id")?),
        id: MessageId(row.try_get("id")?),
        text: row.try_get("text")?,
        html: row.try_get("html")?,
        attachments: serde_json::from_str(row.try_get("attachments_json")?)?,
        cached_at: parse_timestamp(row.try_get("cached_at")?)?,
    })
}

fn folder_from_row(row: &SqliteRow) -> Result<Folder> {
    Ok(Folder {
        account_id: AccountId(row.try_get("account_id")?),
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        folder_type: serde_json::from_str(row.try_get("folder_type")?)?,
        unread_count: row.try_get("unread_count")?,
        total_count: row.try_get("total_count")?,
    })
}

fn manifest_from_row(row: &SqliteRow) -> Result<SyncManifest> {
    let last_sync_at: Option<&str> = row.try_get("last_sync_at")?;
    let cursor: Option<String> = row.try_get("cursor")?;
    Ok(SyncManifest {
        account_id: AccountId(row.try_get("account_id")?),
        folder: row.try_get("folder")?,
        cursor: cursor.map(Cursor::new),
        last_sync_at: last_sync_at.map(parse_timestamp).transpose()?,
        pages_fetched: to_u64(row.try_get("pages_fetched")?),
    })
}

fn mutation_from_row(row: &SqliteRow) -> Result<MutationEntry> {
    let status: &str = row.try_get("status")?;
    Ok(MutationEntry {
        account_id: AccountId(row.try_get("account_id")?),
        seq: to_u64(row.try_get("seq")?),
        target: serde_json::from_str(row.try_get("target_json")?)?,
        op: serde_json::from_str(row.try_get("op_json")?)?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        status: if status == EntryStatus::Failed.as_str() {
            EntryStatus::Failed
        } else {
            EntryStatus::Pending
        },
    })
}

fn aux_from_row(row: &SqliteRow) -> Result<CacheEntry> {
    let namespace: &str = row.try_get("namespace")?;
    let owner_account: Option<i64> = row.try_get("owner_account")?;
    let owner_message: Option<String> = row.try_get("owner_message")?;
    Ok(CacheEntry {
        namespace: AuxNamespace::parse(namespace)
            .ok_or_else(|| Error::StoreCorruption(format!("unknown aux namespace {namespace}")))?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        owner: owner_account
            .zip(owner_message)
            .map(|(account, id)| (AccountId(account), MessageId(id))),
        cached_at: parse_timestamp(row.try_get("cached_at")?)?,
    })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::StoreCorruption(format!("invalid timestamp {value:?}: {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::super::model::FolderType;
    use super::*;

    const ACCOUNT: AccountId = AccountId(1);

    fn delta(id: &str, folder: &str, day: u32) -> MessageDelta {
        MessageDelta {
            account_id: ACCOUNT,
            id: MessageId::from(id),
            folder: folder.to_string(),
            subject: Some(format!("Subject {id}")),
            from_name: Some("Alice".into()),
            from_email: Some("alice@example.com".into()),
            date: Some(Utc.with_ymd_and_hms(2026, 2, day, 12, 0, 0).unwrap()),
            labels: Some(BTreeSet::from(["work".to_string()])),
            ..MessageDelta::default()
        }
    }

    fn body(id: &str, text: &str, age_minutes: i64) -> MessageBody {
        MessageBody {
            account_id: ACCOUNT,
            id: MessageId::from(id),
            text: Some(text.to_string()),
            html: None,
            attachments: Vec::new(),
            cached_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    async fn ids_in(store: &PrimaryStore, folder: &str) -> Vec<String> {
        let mut ids: Vec<String> = store
            .get_all(Table::Messages, &Filter::folder(ACCOUNT, folder))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|record| match record {
                Record::Message(m) => Some(m.id.0),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_fresh_store_has_schema_version() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        let mut conn = store.pool.acquire().await.unwrap();
        let version: i64 = sqlx::query("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
            .get(0);
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let store = PrimaryStore::in_memory(1024 * 1024).await.unwrap();
        let folder = Folder {
            account_id: ACCOUNT,
            path: "Archive/2024".into(),
            name: "2024".into(),
            folder_type: FolderType::Archive,
            unread_count: 3,
            total_count: 10,
        };
        store.put(&Record::Folder(folder.clone())).await.unwrap();

        let key = Key::Folder(ACCOUNT, "Archive/2024".into());
        assert_eq!(store.get(&key).await.unwrap(), Some(Record::Folder(folder)));
        assert_eq!(store.count(Table::Folders, &Filter::account(ACCOUNT)).await.unwrap(), 1);

        assert!(store.delete(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_keeps_fields_missing_from_delta() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        store.merge_messages(&[delta("m1", "INBOX", 1)]).await.unwrap();

        let sparse = MessageDelta {
            account_id: ACCOUNT,
            id: MessageId::from("m1"),
            folder: "INBOX".into(),
            seen: Some(true),
            ..MessageDelta::default()
        };
        let merged = store.merge_messages(&[sparse]).await.unwrap();

        assert_eq!(merged[0].from_name, "Alice");
        assert!(merged[0].labels.contains("work"));
        assert!(merged[0].flags.seen);
    }

    #[tokio::test]
    async fn test_merge_reapplies_pending_mutations() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        store
            .merge_messages(&[delta("m1", "INBOX", 1), delta("m2", "INBOX", 2)])
            .await
            .unwrap();

        let m1 = MutationTarget::Message(MessageId::from("m1"));
        let m2 = MutationTarget::Message(MessageId::from("m2"));
        store
            .enqueue_mutation(ACCOUNT, m1, MutationOp::SetFlags { seen: Some(true), flagged: None })
            .await
            .unwrap();
        store.enqueue_mutation(ACCOUNT, m2, MutationOp::Delete).await.unwrap();

        // The server has not seen either change yet.
        let stale = MessageDelta {
            seen: Some(false),
            ..delta("m1", "INBOX", 1)
        };
        let merged = store
            .merge_messages(&[stale, delta("m2", "INBOX", 2)])
            .await
            .unwrap();

        assert_eq!(merged.len(), 1);
        assert!(merged[0].flags.seen);
        assert_eq!(ids_in(&store, "INBOX").await, vec!["m1"]);
    }

    #[tokio::test]
    async fn test_prune_removes_stale_ids_only() {
        let store = PrimaryStore::in_memory(1024 * 1024).await.unwrap();
        let deltas: Vec<_> = (1..=4).map(|i| delta(&i.to_string(), "INBOX", i)).collect();
        store.merge_messages(&deltas).await.unwrap();
        store
            .put(&Record::Body(body("4", "stale body", 0)))
            .await
            .unwrap();

        let keep: Vec<MessageId> = ["1", "2", "3"].into_iter().map(MessageId::from).collect();
        let pruned = store
            .prune_folder(ACCOUNT, "INBOX", &keep, PruneWindow::Entire)
            .await
            .unwrap();

        assert_eq!(pruned, vec![MessageId::from("4")]);
        assert_eq!(ids_in(&store, "INBOX").await, vec!["1", "2", "3"]);
        assert!(
            store
                .get(&Key::Body(ACCOUNT, MessageId::from("4")))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_prune_skips_pending_moves_and_respects_window() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        let deltas: Vec<_> = (1..=4).map(|i| delta(&i.to_string(), "INBOX", i)).collect();
        store.merge_messages(&deltas).await.unwrap();
        store.merge_messages(&[delta("9", "Archive", 9)]).await.unwrap();
        // Locally moved into INBOX, not yet delivered.
        store
            .enqueue_mutation(
                ACCOUNT,
                MutationTarget::Message(MessageId::from("9")),
                MutationOp::Move { to: "INBOX".into() },
            )
            .await
            .unwrap();

        let oldest = Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).unwrap();
        let pruned = store
            .prune_folder(ACCOUNT, "INBOX", &[MessageId::from("3")], PruneWindow::NewerThan(oldest))
            .await
            .unwrap();

        // 1 and 2 are older than the page; 9 has a pending move.
        assert_eq!(pruned, vec![MessageId::from("4")]);
        assert_eq!(ids_in(&store, "INBOX").await, vec!["1", "2", "3", "9"]);
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_sequences() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        store.merge_messages(&[delta("m1", "INBOX", 1)]).await.unwrap();
        let target = MutationTarget::Message(MessageId::from("m1"));

        let first = store
            .enqueue_mutation(ACCOUNT, target.clone(), MutationOp::Move { to: "Archive".into() })
            .await
            .unwrap();
        let second = store
            .enqueue_mutation(ACCOUNT, target.clone(), MutationOp::AddLabels { labels: vec!["q1".into()] })
            .await
            .unwrap();
        assert!(second.entry.seq > first.entry.seq);
        assert_eq!(first.affected_folders, vec!["INBOX".to_string(), "Archive".to_string()]);

        // Sequences never go back, even after the queue drains.
        store.complete_mutation(ACCOUNT, first.entry.seq).await.unwrap();
        store.complete_mutation(ACCOUNT, second.entry.seq).await.unwrap();
        let third = store
            .enqueue_mutation(ACCOUNT, target, MutationOp::Delete)
            .await
            .unwrap();
        assert!(third.entry.seq > second.entry.seq);
        assert!(third.record.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_mismatched_target() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        let result = store
            .enqueue_mutation(ACCOUNT, MutationTarget::Outgoing("d1".into()), MutationOp::Delete)
            .await;
        assert!(matches!(result, Err(Error::InvalidWrite(_))));
    }

    #[tokio::test]
    async fn test_fail_and_resolve_mutation() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        let outcome = store
            .enqueue_mutation(
                ACCOUNT,
                MutationTarget::Message(MessageId::from("m1")),
                MutationOp::Delete,
            )
            .await
            .unwrap();
        let seq = outcome.entry.seq;

        store.fail_mutation(ACCOUNT, seq, "rejected", true).await.unwrap();
        let Some(Record::Mutation(entry)) = store.get(&Key::Mutation(ACCOUNT, seq)).await.unwrap()
        else {
            panic!("entry missing");
        };
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("rejected"));

        store.resolve_mutation(ACCOUNT, seq, Resolution::Retry).await.unwrap();
        let Some(Record::Mutation(entry)) = store.get(&Key::Mutation(ACCOUNT, seq)).await.unwrap()
        else {
            panic!("entry missing");
        };
        assert_eq!(entry.status, EntryStatus::Pending);

        store.resolve_mutation(ACCOUNT, seq, Resolution::Discard).await.unwrap();
        assert!(matches!(
            store.resolve_mutation(ACCOUNT, seq, Resolution::Discard).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_rejects_whole_batch() {
        let store = PrimaryStore::in_memory(100).await.unwrap();
        store.put(&Record::Body(body("a", &"x".repeat(60), 0))).await.unwrap();

        let result = store
            .bulk_put(&[
                Record::Body(body("b", &"y".repeat(10), 0)),
                Record::Body(body("c", &"z".repeat(50), 0)),
            ])
            .await;

        assert!(matches!(
            result,
            Err(Error::QuotaExceeded {
                needed: 20,
                available: 40
            })
        ));
        assert_eq!(store.usage().await.unwrap().bodies, 60);
        assert!(
            store
                .get(&Key::Body(ACCOUNT, MessageId::from("b")))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_evict_oldest_first_and_skip_pending() {
        let store = PrimaryStore::in_memory(1024 * 1024).await.unwrap();
        store.merge_messages(&[delta("old", "INBOX", 1)]).await.unwrap();
        store
            .bulk_put(&[
                Record::Body(body("old", &"a".repeat(30), 30)),
                Record::Body(body("mid", &"b".repeat(30), 20)),
                Record::Body(body("new", &"c".repeat(30), 10)),
            ])
            .await
            .unwrap();
        store
            .enqueue_mutation(
                ACCOUNT,
                MutationTarget::Message(MessageId::from("old")),
                MutationOp::SetFlags { seen: Some(true), flagged: None },
            )
            .await
            .unwrap();

        let freed = store.evict(EvictionClass::Bodies, 30, None).await.unwrap();
        assert_eq!(freed, 30);
        assert!(store.get(&Key::Body(ACCOUNT, MessageId::from("old"))).await.unwrap().is_some());
        assert!(store.get(&Key::Body(ACCOUNT, MessageId::from("mid"))).await.unwrap().is_none());
        assert!(store.get(&Key::Body(ACCOUNT, MessageId::from("new"))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_advance_manifest_is_compare_and_set() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        let first = Cursor::new("v1");
        let second = Cursor::new("v2");

        assert!(store.advance_manifest(ACCOUNT, "INBOX", None, &first, 1).await.unwrap());
        // A stale writer still holding `None` loses.
        assert!(!store.advance_manifest(ACCOUNT, "INBOX", None, &second, 1).await.unwrap());
        assert!(store.advance_manifest(ACCOUNT, "INBOX", Some(&first), &second, 2).await.unwrap());

        store.reset_manifest(ACCOUNT, "INBOX").await.unwrap();
        let Some(Record::Manifest(manifest)) =
            store.get(&Key::Manifest(ACCOUNT, "INBOX".into())).await.unwrap()
        else {
            panic!("manifest missing");
        };
        assert_eq!(manifest.cursor, None);
        assert_eq!(manifest.pages_fetched, 3);
    }

    #[tokio::test]
    async fn test_wipe_clears_everything() {
        let store = PrimaryStore::in_memory(1024).await.unwrap();
        store.merge_messages(&[delta("m1", "INBOX", 1)]).await.unwrap();
        store.wipe().await.unwrap();

        assert!(store.accounts().await.unwrap().is_empty());
        assert_eq!(store.count(Table::Messages, &Filter::default()).await.unwrap(), 0);
    }

}
