//! Remote-to-store synchronization.

pub mod normalize;
mod orchestrator;

pub use orchestrator::{
    BodyTransform, IdentityTransform, OrchestratorEvent, OrchestratorHandle, OrchestratorMessage,
    PageOutcome, SyncAction, SyncPipeline, SyncReply, SyncSummary, SyncTask, spawn_orchestrator,
};
