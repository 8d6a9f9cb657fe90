//! In-process mailbox service.
//!
//! [`InMemoryRemote`] behaves like the real service closely enough to drive the
//! sync engine offline: it hands out opaque cursors, pages listings, never sends
//! tombstones, and reports deletes of missing messages as not-found. Faults and
//! latency can be injected per operation, and every call is recorded.
//!
//! Cursor format (opaque to clients): `full:{snapshot}:{offset}` while a full
//! listing is being paged, `v{modseq}` for incremental deltas.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::api::RemoteApi;
use crate::error::{Error, Result};
use crate::types::{
    AccountId, Cursor, MessageId, MessagePage, OutgoingMessage, RawBody, RemoteFolder,
    RemoteMessage, RemoteMutation, SendReceipt,
};

/// Remote operation kinds, used for fault matching and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `list_folders`.
    ListFolders,
    /// `fetch_messages`.
    FetchMessages,
    /// `fetch_body`.
    FetchBody,
    /// `mutate`.
    Mutate,
    /// `delete`.
    Delete,
    /// `send`.
    Send,
}

/// The failure an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable failure.
    Transient,
    /// Rejection with the given status.
    Permanent(u16),
    /// Target missing.
    NotFound,
}

impl FaultKind {
    fn to_error(self, op: Operation) -> Error {
        match self {
            Self::Transient => Error::Transient(format!("injected fault on {op:?}")),
            Self::Permanent(status) => Error::Permanent {
                status,
                message: format!("injected fault on {op:?}"),
            },
            Self::NotFound => Error::NotFound(format!("injected fault on {op:?}")),
        }
    }
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Operation to fail.
    pub operation: Operation,
    /// Restrict to one target (message id, folder path or outgoing client id).
    pub target: Option<String>,
    /// What to fail with.
    pub kind: FaultKind,
    /// Number of matching calls to let through before failing.
    pub skip: usize,
    /// Number of calls to fail once armed.
    pub times: usize,
}

impl Fault {
    /// Fails the next matching call once.
    #[must_use]
    pub const fn once(operation: Operation, kind: FaultKind) -> Self {
        Self {
            operation,
            target: None,
            kind,
            skip: 0,
            times: 1,
        }
    }

    /// Restricts the fault to a single target.
    #[must_use]
    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Lets `skip` matching calls through first.
    #[must_use]
    pub const fn after(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Fails `times` calls instead of one.
    #[must_use]
    pub const fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Operation invoked.
    pub operation: Operation,
    /// Account addressed.
    pub account: AccountId,
    /// Target (message id, folder path or outgoing client id).
    pub target: String,
    /// Whether the call succeeded.
    pub ok: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: RemoteMessage,
    modseq: u64,
    body: Option<RawBody>,
}

#[derive(Debug, Default)]
struct AccountState {
    folders: BTreeMap<String, RemoteFolder>,
    messages: HashMap<MessageId, StoredMessage>,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<AccountId, AccountState>,
    modseq: u64,
    faults: Vec<Fault>,
    calls: Vec<CallRecord>,
    sent: Vec<(AccountId, OutgoingMessage)>,
    offline: bool,
    sparse_deltas: bool,
    latency: Duration,
    folder_latency: HashMap<String, Duration>,
}

impl State {
    fn account(&mut self, account: AccountId) -> &mut AccountState {
        self.accounts.entry(account).or_default()
    }

    fn bump(&mut self) -> u64 {
        self.modseq += 1;
        self.modseq
    }

    /// Returns the injected failure for this call, if any.
    fn take_fault(&mut self, operation: Operation, target: &str) -> Option<Error> {
        if self.offline {
            return Some(Error::Transient("service unreachable".to_string()));
        }
        let index = self.faults.iter().position(|fault| {
            fault.operation == operation && fault.target.as_deref().is_none_or(|t| t == target)
        })?;
        let fault = &mut self.faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let error = fault.kind.to_error(operation);
        fault.times = fault.times.saturating_sub(1);
        if fault.times == 0 {
            self.faults.remove(index);
        }
        Some(error)
    }

    fn record(&mut self, operation: Operation, account: AccountId, target: &str, ok: bool) {
        self.calls.push(CallRecord {
            operation,
            account,
            target: target.to_string(),
            ok,
        });
    }
}

/// In-process implementation of [`RemoteApi`].
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces a folder.
    pub fn add_folder(&self, account: AccountId, path: &str, special_use: Option<&str>) {
        let mut state = self.lock();
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        state.account(account).folders.insert(
            path.to_string(),
            RemoteFolder {
                path: path.to_string(),
                name,
                special_use: special_use.map(str::to_string),
                unread_count: 0,
                total_count: 0,
            },
        );
    }

    /// Creates or replaces a message. Missing folders are created.
    pub fn upsert_message(&self, account: AccountId, message: RemoteMessage) {
        let mut state = self.lock();
        let modseq = state.bump();
        let folder = message.folder.clone();
        let acc = state.account(account);
        if !acc.folders.contains_key(&folder) {
            acc.folders.insert(
                folder.clone(),
                RemoteFolder {
                    path: folder.clone(),
                    name: folder.clone(),
                    special_use: None,
                    unread_count: 0,
                    total_count: 0,
                },
            );
        }
        let body = acc.messages.get(&message.id).and_then(|m| m.body.clone());
        acc.messages.insert(
            message.id.clone(),
            StoredMessage {
                message,
                modseq,
                body,
            },
        );
    }

    /// Attaches a body to an existing message.
    pub fn set_body(&self, account: AccountId, body: RawBody) {
        let mut state = self.lock();
        if let Some(stored) = state.account(account).messages.get_mut(&body.id) {
            stored.body = Some(body);
        }
    }

    /// Deletes a message server-side without producing a tombstone.
    pub fn remove_message(&self, account: AccountId, id: &MessageId) {
        self.lock().account(account).messages.remove(id);
    }

    /// Returns the server's current view of a message.
    #[must_use]
    pub fn message(&self, account: AccountId, id: &MessageId) -> Option<RemoteMessage> {
        self.lock()
            .accounts
            .get(&account)
            .and_then(|acc| acc.messages.get(id))
            .map(|stored| stored.message.clone())
    }

    /// Arms a fault.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Makes every call fail with a transient error while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Omits labels and sender display names from incremental deltas.
    pub fn set_sparse_deltas(&self, sparse: bool) {
        self.lock().sparse_deltas = sparse;
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Delays `fetch_messages` for one folder.
    pub fn set_folder_latency(&self, folder: &str, latency: Duration) {
        self.lock()
            .folder_latency
            .insert(folder.to_string(), latency);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Returns calls for one operation.
    #[must_use]
    pub fn calls_for(&self, operation: Operation) -> Vec<CallRecord> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    /// Returns every message accepted by `send`.
    #[must_use]
    pub fn sent(&self) -> Vec<(AccountId, OutgoingMessage)> {
        self.lock().sent.clone()
    }

    async fn delay(&self, folder: Option<&str>) {
        let latency = {
            let state = self.lock();
            folder
                .and_then(|f| state.folder_latency.get(f).copied())
                .unwrap_or(state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Runs one call against the locked state, applying faults and recording it.
    fn call<T>(
        &self,
        operation: Operation,
        account: AccountId,
        target: &str,
        f: impl FnOnce(&mut State) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let result = match state.take_fault(operation, target) {
            Some(error) => Err(error),
            None => f(&mut *state),
        };
        state.record(operation, account, target, result.is_ok());
        result
    }
}

fn parse_cursor(cursor: Option<&Cursor>) -> Result<CursorPosition> {
    let Some(cursor) = cursor else {
        return Ok(CursorPosition::FullStart);
    };
    let raw = cursor.as_str();
    if let Some(rest) = raw.strip_prefix("full:") {
        let (snapshot, offset) = rest
            .split_once(':')
            .ok_or_else(|| Error::from_status(400, format!("malformed cursor {raw}")))?;
        let snapshot = snapshot
            .parse()
            .map_err(|_| Error::from_status(400, format!("malformed cursor {raw}")))?;
        let offset = offset
            .parse()
            .map_err(|_| Error::from_status(400, format!("malformed cursor {raw}")))?;
        return Ok(CursorPosition::Full { snapshot, offset });
    }
    if let Some(modseq) = raw.strip_prefix('v') {
        let modseq = modseq
            .parse()
            .map_err(|_| Error::from_status(400, format!("malformed cursor {raw}")))?;
        return Ok(CursorPosition::Since(modseq));
    }
    Err(Error::from_status(400, format!("malformed cursor {raw}")))
}

enum CursorPosition {
    FullStart,
    Full { snapshot: u64, offset: usize },
    Since(u64),
}

fn full_page(
    state: &State,
    account: AccountId,
    folder: &str,
    snapshot: u64,
    offset: usize,
    page_size: usize,
) -> MessagePage {
    let mut listing: Vec<&StoredMessage> = state
        .accounts
        .get(&account)
        .map(|acc| {
            acc.messages
                .values()
                .filter(|m| m.message.folder == folder)
                .collect()
        })
        .unwrap_or_default();
    listing.sort_by(|a, b| {
        b.message
            .date
            .cmp(&a.message.date)
            .then_with(|| b.message.id.cmp(&a.message.id))
    });

    let messages: Vec<RemoteMessage> = listing
        .iter()
        .skip(offset)
        .take(page_size)
        .map(|m| m.message.clone())
        .collect();
    let consumed = offset + messages.len();
    let has_more = consumed < listing.len();
    let next_cursor = if has_more {
        Cursor::new(format!("full:{snapshot}:{consumed}"))
    } else {
        Cursor::new(format!("v{snapshot}"))
    };

    MessagePage {
        messages,
        next_cursor,
        has_more,
    }
}

fn delta_page(
    state: &State,
    account: AccountId,
    folder: &str,
    since: u64,
    page_size: usize,
) -> MessagePage {
    let mut changed: Vec<&StoredMessage> = state
        .accounts
        .get(&account)
        .map(|acc| {
            acc.messages
                .values()
                .filter(|m| m.message.folder == folder && m.modseq > since)
                .collect()
        })
        .unwrap_or_default();
    changed.sort_by_key(|m| m.modseq);

    let has_more = changed.len() > page_size;
    let page: Vec<&StoredMessage> = changed.into_iter().take(page_size).collect();
    let last = page.last().map_or(since.max(state.modseq), |m| {
        if has_more { m.modseq } else { state.modseq }
    });

    let messages = page
        .iter()
        .map(|m| {
            let mut message = m.message.clone();
            if state.sparse_deltas {
                message.labels = None;
                message.from_name = None;
            }
            message
        })
        .collect();

    MessagePage {
        messages,
        next_cursor: Cursor::new(format!("v{last}")),
        has_more,
    }
}

fn apply_mutation(message: &mut RemoteMessage, mutation: &RemoteMutation) {
    match mutation {
        RemoteMutation::SetFlags { seen, flagged } => {
            if let Some(seen) = seen {
                message.seen = Some(*seen);
            }
            if let Some(flagged) = flagged {
                message.flagged = Some(*flagged);
            }
        }
        RemoteMutation::AddLabels { labels } => {
            let current = message.labels.get_or_insert_with(Vec::new);
            for label in labels {
                if !current.contains(label) {
                    current.push(label.clone());
                }
            }
        }
        RemoteMutation::RemoveLabels { labels } => {
            if let Some(current) = message.labels.as_mut() {
                current.retain(|l| !labels.contains(l));
            }
        }
        RemoteMutation::Move { to } => {
            message.folder.clone_from(to);
        }
    }
}

impl RemoteApi for InMemoryRemote {
    async fn list_folders(&self, account: AccountId) -> Result<Vec<RemoteFolder>> {
        self.delay(None).await;
        self.call(Operation::ListFolders, account, "", |state| {
            let acc = state.account(account);
            let folders = acc
                .folders
                .values()
                .map(|folder| {
                    let in_folder = acc
                        .messages
                        .values()
                        .filter(|m| m.message.folder == folder.path);
                    let (total, unread) = in_folder.fold((0u32, 0u32), |(t, u), m| {
                        (t + 1, u + u32::from(m.message.seen != Some(true)))
                    });
                    RemoteFolder {
                        total_count: total,
                        unread_count: unread,
                        ..folder.clone()
                    }
                })
                .collect();
            Ok(folders)
        })
    }

    async fn fetch_messages(
        &self,
        account: AccountId,
        folder: &str,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<MessagePage> {
        self.delay(Some(folder)).await;
        let position = parse_cursor(cursor)?;
        let page_size = usize::try_from(page_size.max(1)).unwrap_or(usize::MAX);
        self.call(Operation::FetchMessages, account, folder, |state| {
            let page = match position {
                CursorPosition::FullStart => {
                    full_page(state, account, folder, state.modseq, 0, page_size)
                }
                CursorPosition::Full { snapshot, offset } => {
                    full_page(state, account, folder, snapshot, offset, page_size)
                }
                CursorPosition::Since(modseq) => {
                    delta_page(state, account, folder, modseq, page_size)
                }
            };
            debug!(
                "In-memory remote served {} messages for {account}/{folder}",
                page.messages.len()
            );
            Ok(page)
        })
    }

    async fn fetch_body(&self, account: AccountId, id: &MessageId) -> Result<RawBody> {
        self.delay(None).await;
        self.call(Operation::FetchBody, account, id.as_str(), |state| {
            let stored = state
                .account(account)
                .messages
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
            Ok(stored.body.clone().unwrap_or_else(|| RawBody {
                id: id.clone(),
                text: stored.message.snippet.clone(),
                html: None,
                attachments: Vec::new(),
            }))
        })
    }

    async fn mutate(
        &self,
        account: AccountId,
        id: &MessageId,
        mutation: &RemoteMutation,
    ) -> Result<()> {
        self.delay(None).await;
        self.call(Operation::Mutate, account, id.as_str(), |state| {
            let modseq = state.bump();
            let stored = state
                .account(account)
                .messages
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
            apply_mutation(&mut stored.message, mutation);
            stored.modseq = modseq;
            Ok(())
        })
    }

    async fn delete(&self, account: AccountId, id: &MessageId) -> Result<()> {
        self.delay(None).await;
        self.call(Operation::Delete, account, id.as_str(), |state| {
            state
                .account(account)
                .messages
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("message {id}")))
        })
    }

    async fn send(&self, account: AccountId, message: &OutgoingMessage) -> Result<SendReceipt> {
        self.delay(None).await;
        self.call(Operation::Send, account, &message.client_id, |state| {
            let message_id = MessageId::new(format!("sent-{}", message.client_id));
            if state
                .sent
                .iter()
                .any(|(a, m)| *a == account && m.client_id == message.client_id)
            {
                return Ok(SendReceipt { message_id });
            }
            state.sent.push((account, message.clone()));
            let modseq = state.bump();
            state.account(account).messages.insert(
                message_id.clone(),
                StoredMessage {
                    message: RemoteMessage {
                        id: message_id.clone(),
                        folder: "Sent".to_string(),
                        subject: Some(message.subject.clone()),
                        from_email: Some(message.from.clone()),
                        to: Some(message.to.clone()),
                        date: Some(Utc::now()),
                        seen: Some(true),
                        snippet: Some(message.body_text.chars().take(120).collect()),
                        ..RemoteMessage::default()
                    },
                    modseq,
                    body: None,
                },
            );
            Ok(SendReceipt { message_id })
        })
    }
}
