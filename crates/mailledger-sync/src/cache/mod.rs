//! Cache front: in-memory pages, store reads and stale-response rejection.

mod front;
mod generation;
mod memory;

pub use front::{
    CacheFront, ChangeEvent, MessageDetail, PageKey, PageRequest, PageSource, PageView,
    RefreshHandle, RefreshOutcome, RefreshPolicy,
};
pub use generation::{Generation, GenerationCounter};
pub use memory::MemoryCache;
