//! Remote wire types to store models.

use std::collections::BTreeSet;

use mailledger_remote::{AccountId, RawBody, RemoteFolder, RemoteMessage};

use crate::store::{AttachmentRef, Folder, FolderType, MessageBody, MessageDelta};

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Turn a remote message into a delta. Blank strings count as missing.
#[must_use]
pub fn message_delta(account: AccountId, folder: &str, message: RemoteMessage) -> MessageDelta {
    let folder = if message.folder.is_empty() {
        folder.to_string()
    } else {
        message.folder
    };

    MessageDelta {
        account_id: account,
        id: message.id,
        folder,
        subject: message.subject,
        from_name: non_blank(message.from_name),
        from_email: non_blank(message.from_email).map(|email| email.to_lowercase()),
        to: message.to.map(|to| {
            to.into_iter()
                .map(|addr| addr.trim().to_lowercase())
                .filter(|addr| !addr.is_empty())
                .collect()
        }),
        date: message.date,
        seen: message.seen,
        flagged: message.flagged,
        answered: message.answered,
        labels: message.labels.map(|labels| {
            labels
                .into_iter()
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect::<BTreeSet<_>>()
        }),
        snippet: message.snippet,
        thread_id: non_blank(message.thread_id),
        in_reply_to: non_blank(message.in_reply_to),
        has_attachments: message.has_attachments,
    }
}

/// Turn a remote folder into a store folder.
#[must_use]
pub fn folder(account: AccountId, remote: RemoteFolder) -> Folder {
    let name = if remote.name.is_empty() {
        remote
            .path
            .rsplit(['/', '.'])
            .next()
            .unwrap_or(&remote.path)
            .to_string()
    } else {
        remote.name
    };

    Folder {
        account_id: account,
        folder_type: FolderType::classify(remote.special_use.as_deref(), &name),
        path: remote.path,
        name,
        unread_count: remote.unread_count,
        total_count: remote.total_count,
    }
}

/// Turn a (transformed) raw body into a store body.
#[must_use]
pub fn body(account: AccountId, raw: RawBody) -> MessageBody {
    MessageBody {
        account_id: account,
        id: raw.id,
        text: raw.text,
        html: raw.html,
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| AttachmentRef {
                id: a.id,
                filename: a.filename,
                mime_type: a.mime_type,
                size: a.size,
            })
            .collect(),
        cached_at: chrono::Utc::now(),
    }
}
