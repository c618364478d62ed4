use std::sync::Arc;

use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use serde_json::Value;
use shared::{
    domain::{AttachmentKind, ChatId, MessageId, UserId},
    protocol::{conversation_path, ConversationDocument, Message},
    store::{encode, BlobStore, DocumentStore, StoreError},
};
use tracing::{info, warn};
use url::Url;

use crate::{
    block_registry::BlockRegistry,
    chat_index::ChatIndexManager,
    error::{ChatError, ChatResult},
    SessionContext,
};

/// An attachment that already lives in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLink {
    pub url: String,
    pub kind: AttachmentKind,
}

/// Bytes picked by the user, not uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
}

/// Pending compose state. Cleared only by an accepted send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeDraft {
    pub text: String,
    pub attachment: Option<AttachmentUpload>,
}

impl ComposeDraft {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachment.is_none()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.attachment = None;
    }
}

/// An index replica that could not be updated after the message itself
/// was appended.
#[derive(Debug)]
pub struct IndexUpdateFailure {
    pub owner: UserId,
    pub error: ChatError,
}

#[derive(Debug)]
pub struct SendReceipt {
    pub message: Message,
    pub index_failures: Vec<IndexUpdateFailure>,
}

impl SendReceipt {
    pub fn fully_applied(&self) -> bool {
        self.index_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedItem {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedMedia {
    pub photos: Vec<SharedItem>,
    pub files: Vec<SharedItem>,
}

/// The only message the UI offers to delete: the last one, and only to
/// its sender.
pub fn deletable_message_id<'a>(
    conversation: &'a ConversationDocument,
    viewer: &UserId,
) -> Option<&'a MessageId> {
    conversation
        .last_message()
        .filter(|message| &message.sender_id == viewer)
        .map(|message| &message.id)
}

/// Display name for a blob URL: its last path segment, percent-decoded,
/// without the object key's folder.
pub fn attachment_name(url: &str) -> String {
    let segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => url.rsplit('/').next().unwrap_or_default().to_string(),
    };
    let decoded = urlencoding::decode(&segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(segment);
    match decoded.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => decoded,
    }
}

/// Operations on one conversation's shared message log.
#[derive(Clone)]
pub struct ChatSession {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    blocks: BlockRegistry,
    index: ChatIndexManager,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        blocks: BlockRegistry,
        index: ChatIndexManager,
    ) -> Self {
        Self {
            store,
            blobs,
            blocks,
            index,
        }
    }

    /// `None` items mean the conversation document does not exist.
    pub fn subscribe(
        &self,
        chat_id: &ChatId,
    ) -> BoxStream<'static, ChatResult<Option<ConversationDocument>>> {
        self.store
            .subscribe(&conversation_path(chat_id))
            .map(|snapshot| {
                snapshot?
                    .map(|doc| doc.decode().map_err(ChatError::from))
                    .transpose()
            })
            .boxed()
    }

    pub async fn conversation(&self, chat_id: &ChatId) -> ChatResult<ConversationDocument> {
        let doc = self
            .store
            .get(&conversation_path(chat_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {chat_id}")))?;
        Ok(doc.decode()?)
    }

    /// Appends a message and then updates both participants' summaries.
    ///
    /// Returns `Ok(None)` without touching the store when there is neither
    /// text nor attachment. The summary updates are best effort: once the
    /// append has landed the send counts as accepted, and replica failures
    /// are reported on the receipt.
    pub async fn send_message(
        &self,
        ctx: &SessionContext,
        text: &str,
        attachment: Option<AttachmentLink>,
    ) -> ChatResult<Option<SendReceipt>> {
        if text.is_empty() && attachment.is_none() {
            return Ok(None);
        }
        self.blocks
            .ensure_can_send(&ctx.viewer, &ctx.counterpart)
            .await?;

        let (attachment_url, attachment_kind) = match attachment {
            Some(link) => (Some(link.url), Some(link.kind)),
            None => (None, None),
        };
        let message = Message {
            id: MessageId::generate(),
            sender_id: ctx.viewer.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
            attachment_url,
            attachment_kind,
        };
        self.store
            .array_union(
                &conversation_path(&ctx.chat_id),
                "messages",
                vec![encode(&message)?],
            )
            .await?;
        info!(
            chat_id = %ctx.chat_id,
            sender = %ctx.viewer,
            message_id = %message.id,
            "session: message appended"
        );

        let preview = message.preview();
        let sent_at = message.created_at.timestamp_millis();
        let (sender_side, recipient_side) = futures::join!(
            self.index.record_send(
                &ctx.viewer,
                &ctx.chat_id,
                &ctx.counterpart,
                &preview,
                true,
                sent_at
            ),
            self.index.record_send(
                &ctx.counterpart,
                &ctx.chat_id,
                &ctx.viewer,
                &preview,
                false,
                sent_at
            ),
        );

        let mut index_failures = Vec::new();
        for (owner, outcome) in [(&ctx.viewer, sender_side), (&ctx.counterpart, recipient_side)] {
            if let Err(error) = outcome {
                warn!(
                    chat_id = %ctx.chat_id,
                    owner = %owner,
                    %error,
                    "session: summary update failed"
                );
                index_failures.push(IndexUpdateFailure {
                    owner: owner.clone(),
                    error,
                });
            }
        }

        Ok(Some(SendReceipt {
            message,
            index_failures,
        }))
    }

    /// Uploads first, then sends. The block check runs before any bytes
    /// leave. A send failing after the upload leaves the blob orphaned.
    pub async fn send_attachment(
        &self,
        ctx: &SessionContext,
        text: &str,
        upload: AttachmentUpload,
    ) -> ChatResult<Option<SendReceipt>> {
        self.blocks
            .ensure_can_send(&ctx.viewer, &ctx.counterpart)
            .await?;
        let link = self.upload(upload).await?;
        self.send_message(ctx, text, Some(link)).await
    }

    /// Sends whatever the draft holds. The draft is cleared only when the
    /// message was accepted; on any error it is left as it was.
    pub async fn send_draft(
        &self,
        ctx: &SessionContext,
        draft: &mut ComposeDraft,
    ) -> ChatResult<Option<SendReceipt>> {
        if draft.is_empty() {
            return Ok(None);
        }
        let outcome = match draft.attachment.clone() {
            Some(upload) => self.send_attachment(ctx, &draft.text, upload).await,
            None => self.send_message(ctx, &draft.text, None).await,
        };
        match &outcome {
            Ok(Some(_)) => draft.clear(),
            Ok(None) => {}
            Err(error) => {
                warn!(chat_id = %ctx.chat_id, %error, "session: send failed, draft kept");
            }
        }
        outcome
    }

    /// Removes the message with `message_id`, whoever sent it and wherever
    /// it sits in the log.
    pub async fn delete_message(&self, chat_id: &ChatId, message_id: &MessageId) -> ChatResult<()> {
        let path = conversation_path(chat_id);
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {chat_id}")))?;

        // Remove the stored value itself so equality cannot drift through a
        // decode/encode round trip.
        let stored = doc
            .body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages.iter().find(|message| {
                    message.get("id").and_then(Value::as_str) == Some(message_id.as_str())
                })
            })
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id} in {chat_id}")))?;

        self.store
            .array_remove(&path, "messages", vec![stored])
            .await?;
        info!(chat_id = %chat_id, message_id = %message_id, "session: message deleted");
        Ok(())
    }

    pub async fn shared_media(&self, chat_id: &ChatId) -> ChatResult<SharedMedia> {
        let conversation = self.conversation(chat_id).await?;
        let mut media = SharedMedia::default();
        for message in &conversation.messages {
            let Some(url) = &message.attachment_url else {
                continue;
            };
            let item = SharedItem {
                name: attachment_name(url),
                url: url.clone(),
            };
            match message.attachment_kind.unwrap_or_default() {
                AttachmentKind::Image => media.photos.push(item),
                AttachmentKind::File => media.files.push(item),
            }
        }
        Ok(media)
    }

    async fn upload(&self, upload: AttachmentUpload) -> ChatResult<AttachmentLink> {
        let blob = self
            .blobs
            .upload(&upload.filename, upload.bytes)
            .await
            .map_err(upload_failure)?;
        let url = self.blobs.resolve(&blob).await.map_err(upload_failure)?;
        info!(blob = %blob.0, "session: attachment uploaded");
        Ok(AttachmentLink {
            url,
            kind: upload.kind,
        })
    }
}

fn upload_failure(err: StoreError) -> ChatError {
    ChatError::UploadFailure(err.to_string())
}

#[cfg(test)]
#[path = "tests/chat_session_tests.rs"]
mod tests;
