//! Primary store: durable state and the unit that owns it.

pub mod model;
mod repository;
mod worker;

pub use model::*;
pub use repository::{PrimaryStore, SCHEMA_VERSION};
pub use worker::{StoreAction, StoreHandle, StoreReply, spawn_store};
