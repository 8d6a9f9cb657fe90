//! # mailledger-remote
//!
//! Boundary between the `MailLedger` sync engine and the authoritative
//! mailbox service.
//!
//! This crate provides:
//! - [`RemoteApi`], the abstract surface the sync engine consumes
//! - Wire types for folders, message deltas, bodies and outgoing mail
//! - A typed [`Error`] that separates transient, permanent and not-found failures
//! - [`HttpRemote`], a JSON-over-HTTP client
//! - [`InMemoryRemote`], an in-process service with fault injection, used for
//!   offline development and tests

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod api;
mod error;
pub mod http;
pub mod memory;
mod types;

pub use api::RemoteApi;
pub use error::{Error, Result};
pub use http::HttpRemote;
pub use memory::{CallRecord, Fault, FaultKind, InMemoryRemote, Operation};
pub use types::{
    AccountId, Cursor, MessageId, MessagePage, OutgoingMessage, RawBody, RemoteAttachment,
    RemoteFolder, RemoteMessage, RemoteMutation, SendReceipt,
};
