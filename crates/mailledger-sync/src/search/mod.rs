//! Full-text search over synced messages.

mod index;
mod worker;

pub use index::{InvertedIndex, SearchHit, SearchQuery, tokenize};
pub use worker::{
    IndexAction, IndexEvent, IndexHealth, IndexReply, IndexStats, IndexerHandle, spawn_indexer,
};
