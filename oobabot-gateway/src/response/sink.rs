//! The channel-side contract the response pipeline talks to.
//!
//! The Discord adapter implements it over serenity; tests use a recording
//! mock.

use oobabot_core::{ChannelId, HistoryMessage, MessageId};

/// A message the sink has posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

/// Keeps the typing indicator up until dropped.
pub type TypingGuard = Box<dyn Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The message being replied to no longer exists.
    #[error("reply target no longer exists")]
    MissingReference,
    #[error("message not found")]
    NotFound,
    #[error("not supported by this channel: {0}")]
    Unsupported(&'static str),
    #[error("platform error: {0}")]
    Platform(String),
}

#[async_trait::async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(
        &self,
        channel_id: ChannelId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError>;

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), SinkError>;

    async fn delete(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), SinkError>;

    /// Up to `limit` messages older than `before` (or the newest ones when
    /// `before` is `None`), newest first.
    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SinkError>;

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<HistoryMessage, SinkError>;

    fn typing(&self, channel_id: ChannelId) -> TypingGuard;

    async fn send_image(
        &self,
        _channel_id: ChannelId,
        _png: Vec<u8>,
        _description: &str,
        _reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError> {
        Err(SinkError::Unsupported("images"))
    }

    /// Opens a public thread on `message_id` and returns its channel id.
    async fn create_thread(
        &self,
        _channel_id: ChannelId,
        _message_id: MessageId,
        _name: &str,
    ) -> Result<ChannelId, SinkError> {
        Err(SinkError::Unsupported("threads"))
    }
}

/// Sends `text`, dropping the reply reference if its target has vanished.
pub async fn send_with_fallback(
    sink: &dyn ChannelSink,
    channel_id: ChannelId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<SentMessage, SinkError> {
    match sink.send(channel_id, text, reply_to).await {
        Err(SinkError::MissingReference) if reply_to.is_some() => {
            tracing::warn!(
                channel_id,
                "Original message was deleted before we could reply, sending without reference"
            );
            sink.send(channel_id, text, None).await
        }
        other => other,
    }
}
