//! # mailledger-sync
//!
//! Local-first mailbox sync and cache engine for `MailLedger`.
//!
//! This crate provides:
//! - **Primary Store** - the single owner of persisted state (`SQLite`)
//! - **Sync Orchestrator** - cursor-based delta sync with stale pruning
//! - **Search Indexer** - per-account inverted index with drift repair
//! - **Cache Front** - memory/store reads with generation-checked refreshes
//! - **Outbox** - durable, per-target ordered replay of offline writes
//! - **Eviction** - quota enforcement over cached payloads
//!
//! The store, indexer and orchestrator run as independent tasks. They share
//! no state and talk through request/response channels (see [`protocol`]).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
mod engine;
mod error;
pub mod eviction;
pub mod outbox;
pub mod protocol;
pub mod retry;
pub mod search;
pub mod store;
pub mod sync;

pub use cache::{
    CacheFront, ChangeEvent, Generation, MessageDetail, PageRequest, PageSource, PageView,
    RefreshOutcome,
};
pub use config::{EngineConfig, IndexMode, RetryConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use eviction::{EvictionManager, EvictionReport};
pub use outbox::{DrainReport, MutationFailure, MutationQueue};
pub use search::{SearchHit, SearchQuery};
pub use store::{
    MessageBody, MessageRecord, MutationEntry, MutationOp, MutationTarget, Resolution, SortOrder,
};
pub use sync::{BodyTransform, IdentityTransform, SyncSummary};
