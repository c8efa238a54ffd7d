//! [`ChannelSink`] over the Discord REST API.

use std::sync::Arc;
use std::time::Duration;

use oobabot_core::{ChannelId, HistoryMessage, MessageId};
use serenity::builder::{
    CreateAllowedMentions, CreateAttachment, CreateMessage, CreateThread, EditMessage, GetMessages,
};
use serenity::http::{Http, HttpError};
use serenity::model::channel::{Channel, ChannelType, Message};
use serenity::model::id;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::convert::{self, emoji_name};
use crate::response::{ChannelSink, SentMessage, SinkError, TypingGuard};

/// Maximum duration for a typing indicator before it auto-stops.
const TYPING_TIMEOUT: Duration = Duration::from_secs(300);

/// Discord returns at most this many messages per history request.
const MAX_PAGE: usize = 100;

const UNKNOWN_MESSAGE: isize = 10008;

/// Typing indicator with an automatic timeout.
///
/// Wraps serenity's `Typing` so that the indicator stops after
/// [`TYPING_TIMEOUT`] even if the owning task hangs. Dropping this struct
/// stops typing immediately.
struct TimedTyping {
    handle: JoinHandle<()>,
}

impl TimedTyping {
    fn start(channel_id: id::ChannelId, http: &Arc<Http>) -> Self {
        let typing = channel_id.start_typing(http);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TYPING_TIMEOUT).await;
            drop(typing);
        });
        Self { handle }
    }
}

impl Drop for TimedTyping {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn map_error(error: serenity::Error) -> SinkError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &error {
        if response
            .error
            .errors
            .iter()
            .any(|e| e.path.starts_with("message_reference"))
        {
            return SinkError::MissingReference;
        }
        if response.status_code.as_u16() == 404 || response.error.code == UNKNOWN_MESSAGE {
            return SinkError::NotFound;
        }
    }
    SinkError::Platform(error.to_string())
}

pub struct DiscordSink {
    http: Arc<Http>,
    /// Emoji that hide a message when its author (or any bot) adds them.
    ignore_reactions: Vec<String>,
}

impl DiscordSink {
    pub fn new(http: Arc<Http>, ignore_reactions: Vec<String>) -> Self {
        Self {
            http,
            ignore_reactions: ignore_reactions
                .into_iter()
                .filter(|emoji| !emoji.is_empty())
                .collect(),
        }
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    async fn is_hidden_by_reaction(&self, message: &Message) -> bool {
        if self.ignore_reactions.is_empty() {
            return false;
        }
        for reaction in &message.reactions {
            let Some(name) = emoji_name(&reaction.reaction_type) else {
                continue;
            };
            if !self.ignore_reactions.iter().any(|emoji| emoji == name) {
                continue;
            }
            // Bot messages (ours or a proxy bot's) are hidden by anyone.
            if message.author.bot {
                return true;
            }
            match message
                .reaction_users(&self.http, reaction.reaction_type.clone(), Some(100), None::<id::UserId>)
                .await
            {
                Ok(users) if users.iter().any(|user| user.id == message.author.id) => {
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(message_id = message.id.get(), "Could not read reactions: {}", e),
            }
        }
        false
    }

    async fn to_history(&self, message: &Message) -> HistoryMessage {
        let hidden = self.is_hidden_by_reaction(message).await;
        convert::history_message(message, hidden)
    }

    /// Removes one reaction emoji from a message, if we are allowed to.
    pub async fn clear_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        reaction: serenity::model::channel::ReactionType,
    ) {
        if let Err(e) = id::ChannelId::new(channel_id)
            .delete_reaction_emoji(&self.http, id::MessageId::new(message_id), reaction)
            .await
        {
            warn!(channel_id, "No MANAGE_MESSAGES permission, cannot remove reaction: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl ChannelSink for DiscordSink {
    async fn send(
        &self,
        channel_id: ChannelId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError> {
        let channel = id::ChannelId::new(channel_id);
        let mut builder = CreateMessage::new()
            .content(text)
            .allowed_mentions(CreateAllowedMentions::new().all_users(true).replied_user(true));
        if let Some(reply_to) = reply_to {
            builder = builder.reference_message((channel, id::MessageId::new(reply_to)));
        }
        let sent = channel
            .send_message(&self.http, builder)
            .await
            .map_err(map_error)?;
        Ok(SentMessage {
            id: sent.id.get(),
            channel_id,
        })
    }

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), SinkError> {
        id::ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                id::MessageId::new(message_id),
                EditMessage::new().content(text),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), SinkError> {
        id::ChannelId::new(channel_id)
            .delete_message(&self.http, id::MessageId::new(message_id))
            .await
            .map_err(map_error)
    }

    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SinkError> {
        let limit = limit.clamp(1, MAX_PAGE) as u8;
        let mut request = GetMessages::new().limit(limit);
        if let Some(before) = before {
            request = request.before(id::MessageId::new(before));
        }
        let messages = id::ChannelId::new(channel_id)
            .messages(&self.http, request)
            .await
            .map_err(map_error)?;

        let mut history = Vec::with_capacity(messages.len());
        for message in &messages {
            history.push(self.to_history(message).await);
        }
        Ok(history)
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<HistoryMessage, SinkError> {
        let message = id::ChannelId::new(channel_id)
            .message(&self.http, id::MessageId::new(message_id))
            .await
            .map_err(map_error)?;
        Ok(self.to_history(&message).await)
    }

    fn typing(&self, channel_id: ChannelId) -> TypingGuard {
        Box::new(TimedTyping::start(id::ChannelId::new(channel_id), &self.http))
    }

    async fn send_image(
        &self,
        channel_id: ChannelId,
        png: Vec<u8>,
        description: &str,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError> {
        let channel = id::ChannelId::new(channel_id);
        let attachment = CreateAttachment::bytes(png, "image.png").description(description);
        let mut builder = CreateMessage::new().add_file(attachment);
        if let Some(reply_to) = reply_to {
            builder = builder.reference_message((channel, id::MessageId::new(reply_to)));
        }
        let sent = channel
            .send_message(&self.http, builder)
            .await
            .map_err(map_error)?;
        Ok(SentMessage {
            id: sent.id.get(),
            channel_id,
        })
    }

    async fn create_thread(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        name: &str,
    ) -> Result<ChannelId, SinkError> {
        let channel = id::ChannelId::new(channel_id);
        let kind = match channel.to_channel(&self.http).await.map_err(map_error)? {
            Channel::Guild(guild_channel) => guild_channel.kind,
            _ => return Err(SinkError::Unsupported("threads outside guilds")),
        };
        if !matches!(kind, ChannelType::Text | ChannelType::News) {
            return Err(SinkError::Unsupported("threads in this channel type"));
        }
        // Discord caps thread names at 100 characters.
        let name: String = name.chars().take(100).collect();
        let thread = channel
            .create_thread_from_message(
                &self.http,
                id::MessageId::new(message_id),
                CreateThread::new(name),
            )
            .await
            .map_err(map_error)?;
        Ok(thread.id.get())
    }
}
