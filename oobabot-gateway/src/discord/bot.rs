use std::sync::Arc;

use oobabot_core::ChatMessage;
use serenity::async_trait;
use serenity::model::application::{Command, Interaction};
use serenity::model::channel::{Message, Reaction};
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use serenity::prelude::*;
use tracing::{debug, error, info};

use crate::response::{ChannelSink, SinkError};
use crate::state::AppState;

use super::commands;
use super::convert::{self, emoji_name};
use super::presence::{PresenceManager, PresenceTarget};
use super::sink::DiscordSink;

/// Hide the message and everything before it from the bot.
const REWIND: &str = "⏪";
/// Make the bot answer the message.
const POKE: &str = "👆";
/// Delete one of the bot's messages.
const DELETE: &str = "❌";
/// Rewrite one of the bot's messages.
const REGENERATE: &str = "🔁";

/// Discord event handler. Everything past event decoding lives in the
/// queue and the response pipeline.
pub struct Bot {
    pub(super) state: Arc<AppState>,
    pub(super) sink: Arc<DiscordSink>,
    pub(super) presence: Arc<PresenceManager>,
}

impl Bot {
    pub fn new(
        state: Arc<AppState>,
        sink: Arc<DiscordSink>,
        presence: Arc<PresenceManager>,
    ) -> Self {
        Self {
            state,
            sink,
            presence,
        }
    }

    /// Cancels any panic, guarantees a reply to `message` and feeds it
    /// through the queue.
    pub(super) async fn poke(&self, message: ChatMessage) {
        self.state.engine.log_mention(
            message.guild_key(),
            message.channel_id,
            message.send_timestamp,
        );
        self.state.queue.poke(message).await;
    }

    /// Stops paying attention to the channel until summoned again.
    pub(super) fn unpoke(&self, guild_id: Option<GuildId>, channel_id: ChannelId) {
        let channel_id = channel_id.get();
        let guild_key = guild_id.map_or(channel_id, GuildId::get);
        self.state.queue.panic(channel_id);
        self.state.engine.log_cooldown(guild_key, channel_id);
    }

    async fn handle_reaction(&self, ctx: &Context, reaction: &Reaction) {
        let Some(emoji) = emoji_name(&reaction.emoji) else {
            return;
        };
        if ![REWIND, POKE, DELETE, REGENERATE].contains(&emoji) {
            return;
        }
        let bot_user_id = self.state.engine.bot_user_id();
        if reaction.user_id.is_some_and(|user| user.get() == bot_user_id) {
            return;
        }

        let channel_id = reaction.channel_id.get();
        let message_id = reaction.message_id.get();
        let is_private = reaction.guild_id.is_none();
        // The message may already be gone, e.g. when another bot also
        // deletes on ❌.
        let message = match reaction.message(&ctx.http).await {
            Ok(message) => message,
            Err(e) => {
                debug!(channel_id, message_id, "Reacted message unavailable: {}", e);
                return;
            }
        };

        match emoji {
            REWIND => {
                debug!(channel_id, message_id, "Hiding chat history at and before message");
                self.state
                    .repetition
                    .hide_messages_before(channel_id, message_id);
                if !is_private {
                    self.sink
                        .clear_reaction(channel_id, message_id, reaction.emoji.clone())
                        .await;
                }
            }
            POKE => {
                debug!(channel_id, message_id, "Received poke");
                if !is_private {
                    self.sink
                        .clear_reaction(channel_id, message_id, reaction.emoji.clone())
                        .await;
                }
                if self.state.engine.is_hidden(&message.content) {
                    return;
                }
                self.poke(convert::chat_message(&message)).await;
            }
            _ if message.author.id.get() != bot_user_id => {}
            DELETE => {
                debug!(channel_id, message_id, "Received message deletion request");
                match self.sink.delete(channel_id, message_id).await {
                    Ok(()) | Err(SinkError::NotFound) => {}
                    Err(e) => error!(channel_id, message_id, "Could not delete message: {}", e),
                }
            }
            REGENERATE => {
                debug!(channel_id, message_id, "Received response regeneration request");
                let replied_to = message
                    .message_reference
                    .as_ref()
                    .and_then(|reference| reference.message_id)
                    .map(MessageId::get);
                if let Err(e) = self
                    .state
                    .pipeline
                    .regenerate(channel_id, message_id, replied_to, None)
                    .await
                {
                    error!(channel_id, message_id, "Error while regenerating response: {}", e);
                    self.state.stats.log_failure();
                }
                if !is_private {
                    self.sink
                        .clear_reaction(channel_id, message_id, reaction.emoji.clone())
                        .await;
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl EventHandler for Bot {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.id.get() == self.state.engine.bot_user_id() {
            return;
        }
        let message = convert::chat_message(&msg);
        info!(
            event_kind = "chat_io",
            channel_id = message.channel_id,
            message_id = message.id,
            "{}: {}",
            message.author_name,
            message.body_text
        );
        self.state.queue.process(message).await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.state
            .queue
            .remove(channel_id.get(), deleted_message_id.get());
    }

    async fn reaction_add(&self, ctx: Context, add_reaction: Reaction) {
        self.handle_reaction(&ctx, &add_reaction).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Some(command) = interaction.as_command() {
            self.handle_command(&ctx, command).await;
        }
    }

    /// Remember who we are and register slash commands.
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        self.state.engine.set_bot_user_id(ready.user.id.get());
        self.presence
            .attach(Arc::new(ctx.shard.clone()) as Arc<dyn PresenceTarget>);

        let commands = commands::definitions(&self.state.settings.persona.ai_name);
        if let Err(e) = Command::set_global_commands(&ctx.http, commands).await {
            error!("Failed to register slash commands: {}", e);
        }
    }
}
