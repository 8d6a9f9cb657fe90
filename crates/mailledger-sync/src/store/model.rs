//! Store data models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use mailledger_remote::{AccountId, Cursor, MessageId, OutgoingMessage, RemoteMutation};
use serde::{Deserialize, Serialize};

/// Type of folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    /// Inbox folder.
    Inbox,
    /// Sent mail folder.
    Sent,
    /// Drafts folder.
    Drafts,
    /// Trash folder.
    Trash,
    /// Spam/junk folder.
    Spam,
    /// Archive folder.
    Archive,
    /// Regular folder.
    Regular,
}

impl FolderType {
    /// Detect folder type from name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower == "inbox" {
            Self::Inbox
        } else if lower.contains("sent") {
            Self::Sent
        } else if lower.contains("draft") {
            Self::Drafts
        } else if lower.contains("trash") || lower.contains("deleted") {
            Self::Trash
        } else if lower.contains("spam") || lower.contains("junk") {
            Self::Spam
        } else if lower.contains("archive") {
            Self::Archive
        } else {
            Self::Regular
        }
    }

    /// Classify from a server special-use hint, falling back to the name.
    #[must_use]
    pub fn classify(special_use: Option<&str>, name: &str) -> Self {
        match special_use.map(|hint| FolderType::from_name(hint.trim_start_matches('\\'))) {
            Some(Self::Regular) | None => Self::from_name(name),
            Some(kind) => kind,
        }
    }
}

/// A synchronized folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Owning account.
    pub account_id: AccountId,
    /// Full path (including hierarchy).
    pub path: String,
    /// Display name.
    pub name: String,
    /// Special-use classification.
    pub folder_type: FolderType,
    /// Number of unread messages.
    pub unread_count: u32,
    /// Total number of messages.
    pub total_count: u32,
}

/// Message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// Read.
    pub seen: bool,
    /// Flagged/starred.
    pub flagged: bool,
    /// Answered.
    pub answered: bool,
}

/// Canonical message metadata, keyed by (account, id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Owning account.
    pub account_id: AccountId,
    /// Server message id.
    pub id: MessageId,
    /// Folder path.
    pub folder: String,
    /// Subject line.
    pub subject: String,
    /// Sender display name.
    pub from_name: String,
    /// Sender address.
    pub from_email: String,
    /// Recipients.
    pub to: Vec<String>,
    /// Message date.
    pub date: DateTime<Utc>,
    /// Flags.
    pub flags: MessageFlags,
    /// Label set.
    pub labels: BTreeSet<String>,
    /// Preview text.
    pub snippet: String,
    /// Conversation identifier.
    pub thread_id: Option<String>,
    /// `In-Reply-To` identifier.
    pub in_reply_to: Option<String>,
    /// Whether the message carries attachments.
    pub has_attachments: bool,
}

impl MessageRecord {
    /// Apply a mutation to the local copy.
    ///
    /// Returns false for operations that do not change the record in place
    /// (deletes and sends).
    pub fn apply(&mut self, op: &MutationOp) -> bool {
        match op {
            MutationOp::SetFlags { seen, flagged } => {
                if let Some(seen) = seen {
                    self.flags.seen = *seen;
                }
                if let Some(flagged) = flagged {
                    self.flags.flagged = *flagged;
                }
                true
            }
            MutationOp::AddLabels { labels } => {
                self.labels.extend(labels.iter().cloned());
                true
            }
            MutationOp::RemoveLabels { labels } => {
                for label in labels {
                    self.labels.remove(label);
                }
                true
            }
            MutationOp::Move { to } => {
                self.folder.clone_from(to);
                true
            }
            MutationOp::Delete | MutationOp::Send { .. } => false,
        }
    }
}

/// A normalized message from a delta page.
///
/// `None` means the server did not send the field; merging keeps the
/// stored value in that case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Owning account.
    pub account_id: AccountId,
    /// Server message id.
    pub id: MessageId,
    /// Folder path.
    pub folder: String,
    /// Subject line.
    pub subject: Option<String>,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Sender address.
    pub from_email: Option<String>,
    /// Recipients.
    pub to: Option<Vec<String>>,
    /// Message date.
    pub date: Option<DateTime<Utc>>,
    /// Read state.
    pub seen: Option<bool>,
    /// Flagged state.
    pub flagged: Option<bool>,
    /// Answered state.
    pub answered: Option<bool>,
    /// Label set.
    pub labels: Option<BTreeSet<String>>,
    /// Preview text.
    pub snippet: Option<String>,
    /// Conversation identifier.
    pub thread_id: Option<String>,
    /// `In-Reply-To` identifier.
    pub in_reply_to: Option<String>,
    /// Attachment marker.
    pub has_attachments: Option<bool>,
}

impl MessageDelta {
    /// Merge onto the stored record, keeping stored values for missing fields.
    ///
    /// `now` dates messages that have neither a server date nor a stored one.
    #[must_use]
    pub fn merge_onto(&self, existing: Option<&MessageRecord>, now: DateTime<Utc>) -> MessageRecord {
        fn pick<T: Clone + Default>(new: Option<&T>, old: Option<&T>) -> T {
            new.or(old).cloned().unwrap_or_default()
        }

        let old = existing;
        MessageRecord {
            account_id: self.account_id,
            id: self.id.clone(),
            folder: self.folder.clone(),
            subject: pick(self.subject.as_ref(), old.map(|r| &r.subject)),
            from_name: pick(self.from_name.as_ref(), old.map(|r| &r.from_name)),
            from_email: pick(self.from_email.as_ref(), old.map(|r| &r.from_email)),
            to: pick(self.to.as_ref(), old.map(|r| &r.to)),
            date: self.date.or(old.map(|r| r.date)).unwrap_or(now),
            flags: MessageFlags {
                seen: self.seen.or(old.map(|r| r.flags.seen)).unwrap_or_default(),
                flagged: self
                    .flagged
                    .or(old.map(|r| r.flags.flagged))
                    .unwrap_or_default(),
                answered: self
                    .answered
                    .or(old.map(|r| r.flags.answered))
                    .unwrap_or_default(),
            },
            labels: pick(self.labels.as_ref(), old.map(|r| &r.labels)),
            snippet: pick(self.snippet.as_ref(), old.map(|r| &r.snippet)),
            thread_id: self
                .thread_id
                .clone()
                .or_else(|| old.and_then(|r| r.thread_id.clone())),
            in_reply_to: self
                .in_reply_to
                .clone()
                .or_else(|| old.and_then(|r| r.in_reply_to.clone())),
            has_attachments: self
                .has_attachments
                .or(old.map(|r| r.has_attachments))
                .unwrap_or_default(),
        }
    }
}

/// Attachment reference inside a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Server attachment id.
    pub id: String,
    /// Filename.
    pub filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// Sanitized message content, populated lazily and evictable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Owning account.
    pub account_id: AccountId,
    /// Message id.
    pub id: MessageId,
    /// Plain text part.
    pub text: Option<String>,
    /// Sanitized HTML part.
    pub html: Option<String>,
    /// Attachments.
    pub attachments: Vec<AttachmentRef>,
    /// When the body was stored.
    pub cached_at: DateTime<Utc>,
}

impl MessageBody {
    /// Bytes counted against the quota.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        let text = self.text.as_ref().map_or(0, String::len);
        let html = self.html.as_ref().map_or(0, String::len);
        let attachments: usize = self
            .attachments
            .iter()
            .map(|a| a.id.len() + a.filename.len() + a.mime_type.len())
            .sum();
        u64::try_from(text + html + attachments).unwrap_or(u64::MAX)
    }
}

/// Per-folder sync position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    /// Owning account.
    pub account_id: AccountId,
    /// Folder path.
    pub folder: String,
    /// Last server cursor; `None` means the next fetch is a full resync.
    pub cursor: Option<Cursor>,
    /// When the cursor last advanced.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Pages fetched over the folder's lifetime.
    pub pages_fetched: u64,
}

/// Persisted search index snapshot for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPayload {
    /// Owning account.
    pub account_id: AccountId,
    /// Serialized index.
    pub payload: String,
    /// When the snapshot was written.
    pub cached_at: DateTime<Utc>,
}

impl IndexPayload {
    /// Bytes counted against the quota.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        u64::try_from(self.payload.len()).unwrap_or(u64::MAX)
    }
}

/// Record-count watermark of a persisted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Owning account.
    pub account_id: AccountId,
    /// Messages covered by the persisted index.
    pub count: u64,
    /// When the watermark was written.
    pub updated_at: DateTime<Utc>,
}

/// Namespaces of the auxiliary key/value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxNamespace {
    /// Contact lookups.
    Contact,
    /// Downloaded attachment content.
    AttachmentBlob,
    /// Local drafts.
    Draft,
    /// Engine or user settings.
    Setting,
}

impl AuxNamespace {
    /// Stable column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::AttachmentBlob => "attachment_blob",
            Self::Draft => "draft",
            Self::Setting => "setting",
        }
    }

    /// Parse a column value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contact" => Some(Self::Contact),
            "attachment_blob" => Some(Self::AttachmentBlob),
            "draft" => Some(Self::Draft),
            "setting" => Some(Self::Setting),
            _ => None,
        }
    }
}

/// Auxiliary cache entry with no schema coupling to the primary tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Namespace.
    pub namespace: AuxNamespace,
    /// Key within the namespace.
    pub key: String,
    /// Opaque value.
    pub value: Vec<u8>,
    /// Message this entry belongs to, if any. Entries owned by a message with
    /// unresolved outbox entries are never evicted.
    pub owner: Option<(AccountId, MessageId)>,
    /// When the entry was stored.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Bytes counted against the quota.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        u64::try_from(self.key.len() + self.value.len()).unwrap_or(u64::MAX)
    }
}

/// What an outbox entry addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MutationTarget {
    /// An existing message.
    Message(MessageId),
    /// An outgoing message, by client id.
    Outgoing(String),
}

impl MutationTarget {
    /// Key used to group entries by target.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Message(id) => format!("msg:{id}"),
            Self::Outgoing(id) => format!("out:{id}"),
        }
    }

    /// Message id, for message targets.
    #[must_use]
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Message(id) => Some(id),
            Self::Outgoing(_) => None,
        }
    }
}

/// A user-initiated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationOp {
    /// Set read and/or flagged state.
    SetFlags {
        /// New read state.
        seen: Option<bool>,
        /// New flagged state.
        flagged: Option<bool>,
    },
    /// Add labels.
    AddLabels {
        /// Labels to add.
        labels: Vec<String>,
    },
    /// Remove labels.
    RemoveLabels {
        /// Labels to remove.
        labels: Vec<String>,
    },
    /// Move to another folder.
    Move {
        /// Destination folder path.
        to: String,
    },
    /// Delete the message.
    Delete,
    /// Send an outgoing message.
    Send {
        /// Message to send.
        message: OutgoingMessage,
    },
}

impl MutationOp {
    /// Short operation name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetFlags { .. } => "set_flags",
            Self::AddLabels { .. } => "add_labels",
            Self::RemoveLabels { .. } => "remove_labels",
            Self::Move { .. } => "move",
            Self::Delete => "delete",
            Self::Send { .. } => "send",
        }
    }

    /// Returns true for operations that take a message out of its folder.
    #[must_use]
    pub const fn removes_from_folder(&self) -> bool {
        matches!(self, Self::Move { .. } | Self::Delete)
    }

    /// Returns true if the operation fits the target kind.
    #[must_use]
    pub const fn fits(&self, target: &MutationTarget) -> bool {
        matches!(
            (self, target),
            (Self::Send { .. }, MutationTarget::Outgoing(_))
                | (
                    Self::SetFlags { .. }
                        | Self::AddLabels { .. }
                        | Self::RemoveLabels { .. }
                        | Self::Move { .. }
                        | Self::Delete,
                    MutationTarget::Message(_)
                )
        )
    }

    /// The remote mutation for flag/label/folder changes.
    #[must_use]
    pub fn to_remote(&self) -> Option<RemoteMutation> {
        match self {
            Self::SetFlags { seen, flagged } => Some(RemoteMutation::SetFlags {
                seen: *seen,
                flagged: *flagged,
            }),
            Self::AddLabels { labels } => Some(RemoteMutation::AddLabels {
                labels: labels.clone(),
            }),
            Self::RemoveLabels { labels } => Some(RemoteMutation::RemoveLabels {
                labels: labels.clone(),
            }),
            Self::Move { to } => Some(RemoteMutation::Move { to: to.clone() }),
            Self::Delete | Self::Send { .. } => None,
        }
    }
}

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for delivery.
    Pending,
    /// Rejected by the server; holds its target until resolved.
    Failed,
}

impl EntryStatus {
    /// Stable column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

/// One durable outbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Owning account.
    pub account_id: AccountId,
    /// Per-account sequence number, strictly increasing.
    pub seq: u64,
    /// Addressed entity.
    pub target: MutationTarget,
    /// Operation.
    pub op: MutationOp,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Last delivery error.
    pub last_error: Option<String>,
    /// Delivery state.
    pub status: EntryStatus,
}

/// How to resolve a failed outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Put the entry back in line.
    Retry,
    /// Drop the entry. Local state converges on the next sync.
    Discard,
}

/// Result of appending to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The new entry.
    pub entry: MutationEntry,
    /// Local record after the optimistic apply; `None` if it was deleted or
    /// the target is not a stored message.
    pub record: Option<MessageRecord>,
    /// Folders whose listings changed.
    pub affected_folders: Vec<String>,
}

/// Store tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Message metadata.
    Messages,
    /// Message bodies.
    Bodies,
    /// Folders.
    Folders,
    /// Sync manifests.
    Manifests,
    /// Outbox entries.
    Outbox,
    /// Search index snapshots.
    IndexPayloads,
    /// Search index watermarks.
    IndexMeta,
    /// Auxiliary key/value entries.
    Aux,
}

impl Table {
    /// All tables.
    pub const ALL: [Self; 8] = [
        Self::Messages,
        Self::Bodies,
        Self::Folders,
        Self::Manifests,
        Self::Outbox,
        Self::IndexPayloads,
        Self::IndexMeta,
        Self::Aux,
    ];
}

/// Primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Message metadata.
    Message(AccountId, MessageId),
    /// Message body.
    Body(AccountId, MessageId),
    /// Folder by path.
    Folder(AccountId, String),
    /// Manifest by folder path.
    Manifest(AccountId, String),
    /// Outbox entry by sequence.
    Mutation(AccountId, u64),
    /// Index snapshot.
    IndexPayload(AccountId),
    /// Index watermark.
    IndexMeta(AccountId),
    /// Auxiliary entry.
    Aux(AuxNamespace, String),
}

impl Key {
    /// Table holding the key.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Message(..) => Table::Messages,
            Self::Body(..) => Table::Bodies,
            Self::Folder(..) => Table::Folders,
            Self::Manifest(..) => Table::Manifests,
            Self::Mutation(..) => Table::Outbox,
            Self::IndexPayload(_) => Table::IndexPayloads,
            Self::IndexMeta(_) => Table::IndexMeta,
            Self::Aux(..) => Table::Aux,
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Message metadata.
    Message(MessageRecord),
    /// Message body.
    Body(MessageBody),
    /// Folder.
    Folder(Folder),
    /// Sync manifest.
    Manifest(SyncManifest),
    /// Outbox entry.
    Mutation(MutationEntry),
    /// Index snapshot.
    IndexPayload(IndexPayload),
    /// Index watermark.
    IndexMeta(IndexMeta),
    /// Auxiliary entry.
    Aux(CacheEntry),
}

impl Record {
    /// Table the record belongs to.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Message(_) => Table::Messages,
            Self::Body(_) => Table::Bodies,
            Self::Folder(_) => Table::Folders,
            Self::Manifest(_) => Table::Manifests,
            Self::Mutation(_) => Table::Outbox,
            Self::IndexPayload(_) => Table::IndexPayloads,
            Self::IndexMeta(_) => Table::IndexMeta,
            Self::Aux(_) => Table::Aux,
        }
    }

    /// Primary key of the record.
    #[must_use]
    pub fn key(&self) -> Key {
        match self {
            Self::Message(r) => Key::Message(r.account_id, r.id.clone()),
            Self::Body(r) => Key::Body(r.account_id, r.id.clone()),
            Self::Folder(r) => Key::Folder(r.account_id, r.path.clone()),
            Self::Manifest(r) => Key::Manifest(r.account_id, r.folder.clone()),
            Self::Mutation(r) => Key::Mutation(r.account_id, r.seq),
            Self::IndexPayload(r) => Key::IndexPayload(r.account_id),
            Self::IndexMeta(r) => Key::IndexMeta(r.account_id),
            Self::Aux(r) => Key::Aux(r.namespace, r.key.clone()),
        }
    }
}

/// Row filter for `get_all`, `count` and friends. Unset fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Restrict to one account.
    pub account: Option<AccountId>,
    /// Restrict to one folder (messages and manifests).
    pub folder: Option<String>,
    /// Restrict to one namespace (aux entries).
    pub namespace: Option<AuxNamespace>,
}

impl Filter {
    /// Everything belonging to an account.
    #[must_use]
    pub fn account(account: AccountId) -> Self {
        Self {
            account: Some(account),
            ..Self::default()
        }
    }

    /// Everything in one folder of an account.
    #[must_use]
    pub fn folder(account: AccountId, folder: impl Into<String>) -> Self {
        Self {
            account: Some(account),
            folder: Some(folder.into()),
            namespace: None,
        }
    }
}

/// Message ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    DateDesc,
    /// Oldest first.
    DateAsc,
}

/// Index-backed range queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// A page of a folder listing.
    FolderMessages {
        /// Account.
        account: AccountId,
        /// Folder path.
        folder: String,
        /// Ordering.
        sort: SortOrder,
        /// Rows to skip.
        offset: u32,
        /// Rows to return.
        limit: u32,
    },
    /// Unresolved outbox entries of an account, by sequence.
    Mutations {
        /// Account.
        account: AccountId,
    },
    /// Auxiliary entries of one namespace, oldest first.
    AuxByNamespace {
        /// Namespace.
        namespace: AuxNamespace,
    },
}

/// Cached payload classes, in eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionClass {
    /// Attachment content in the aux table.
    AttachmentBlobs,
    /// Search index snapshots.
    IndexPayloads,
    /// Message bodies.
    Bodies,
}

impl EvictionClass {
    /// Fixed eviction priority: first entry goes first.
    pub const ORDER: [Self; 3] = [Self::AttachmentBlobs, Self::IndexPayloads, Self::Bodies];
}

/// Payload bytes per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Message bodies.
    pub bodies: u64,
    /// Search index snapshots.
    pub index_payloads: u64,
    /// Attachment blobs.
    pub attachment_blobs: u64,
    /// Other aux entries.
    pub other_aux: u64,
    /// Configured quota.
    pub quota: u64,
}

impl StorageUsage {
    /// Total payload bytes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.bodies + self.index_payloads + self.attachment_blobs + self.other_aux
    }

    /// Bytes held by one eviction class.
    #[must_use]
    pub const fn of(&self, class: EvictionClass) -> u64 {
        match class {
            EvictionClass::AttachmentBlobs => self.attachment_blobs,
            EvictionClass::IndexPayloads => self.index_payloads,
            EvictionClass::Bodies => self.bodies,
        }
    }
}

/// Range of a folder that a full-resync page covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneWindow {
    /// The page holds the whole folder.
    Entire,
    /// The page holds every message dated after this instant. Messages at
    /// exactly this instant may continue on the next page.
    NewerThan(DateTime<Utc>),
}
