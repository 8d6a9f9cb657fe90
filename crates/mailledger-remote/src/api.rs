//! The remote API surface consumed by the sync engine.

use std::future::Future;

use crate::Result;
use crate::types::{
    AccountId, Cursor, MessageId, MessagePage, OutgoingMessage, RawBody, RemoteFolder,
    RemoteMutation, SendReceipt,
};

/// Authoritative mailbox service.
///
/// Implementations must be idempotent-safe where the operation allows it:
/// deleting or moving a message that is already gone reports
/// [`Error::NotFound`](crate::Error::NotFound) rather than a generic failure,
/// so callers can treat it as "already applied".
pub trait RemoteApi: Send + Sync + 'static {
    /// List all folders of an account.
    fn list_folders(
        &self,
        account: AccountId,
    ) -> impl Future<Output = Result<Vec<RemoteFolder>>> + Send;

    /// Fetch one page of message metadata for a folder.
    ///
    /// A `None` cursor requests a full listing from the newest message down.
    fn fetch_messages(
        &self,
        account: AccountId,
        folder: &str,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> impl Future<Output = Result<MessagePage>> + Send;

    /// Fetch the full body of a single message.
    fn fetch_body(
        &self,
        account: AccountId,
        id: &MessageId,
    ) -> impl Future<Output = Result<RawBody>> + Send;

    /// Change flags, labels or folder of a message.
    fn mutate(
        &self,
        account: AccountId,
        id: &MessageId,
        mutation: &RemoteMutation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a message.
    fn delete(&self, account: AccountId, id: &MessageId) -> impl Future<Output = Result<()>> + Send;

    /// Send an outgoing message.
    fn send(
        &self,
        account: AccountId,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<SendReceipt>> + Send;
}
