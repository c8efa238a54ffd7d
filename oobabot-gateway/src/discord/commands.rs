//! Slash commands.

use serenity::builder::{
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse, GetMessages,
};
use serenity::model::application::{
    CommandInteraction, CommandOptionType, CurrentApplicationInfo, InteractionResponseFlags,
    TeamMemberRole,
};
use serenity::model::channel::{Channel, ChannelType, Message};
use serenity::model::id::{MessageId, UserId};
use serenity::prelude::*;
use tracing::{debug, error, warn};

use crate::response::ChannelSink;

use super::bot::Bot;
use super::convert;
use super::presence::{STATUS_CHARACTER_LIMIT, parse_status};

const LOBOTOMIZE_RESPONSE: &str = "Ummmm... what were we talking about?";

pub fn definitions(ai_name: &str) -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("lobotomize").description(format!(
            "Erase {ai_name}'s memory of any message before now in this channel."
        )),
        CreateCommand::new("poke")
            .description(format!(
                "Prompt {ai_name} to write a response to the last message."
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "message",
                    format!("Message link or ID to prompt {ai_name} to respond to."),
                )
                .required(false),
            ),
        CreateCommand::new("unpoke").description(format!(
            "Have {ai_name} stop responding in the current channel until summoned again."
        )),
        CreateCommand::new("say")
            .description(format!("Force {ai_name} to say the provided message."))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "message",
                    format!("Message to force {ai_name} to say."),
                )
                .required(true),
            ),
        CreateCommand::new("edit")
            .description(format!(
                "Replace {ai_name}'s most recent message in the channel with the provided message."
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "text",
                    format!("Text to replace {ai_name}'s last message with."),
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "message",
                    format!("Message link or ID from {ai_name} to edit."),
                )
                .required(false),
            ),
        CreateCommand::new("rewrite")
            .description(format!(
                "Rewrite {ai_name}'s most recent response in the channel according to the \
                 provided instruction."
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "instruction",
                    format!("Instruction for {ai_name} to follow."),
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "message",
                    format!("A link to a message from {ai_name} to rewrite."),
                )
                .required(false),
            ),
        CreateCommand::new("stop")
            .description(format!("Force {ai_name} to stop typing the current message.")),
        CreateCommand::new("status")
            .description(format!(
                "Set {ai_name}'s status to the provided text, or clear if none is provided."
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "text",
                    format!("Text to set {ai_name}'s status to."),
                )
                .min_length(1)
                .max_length(STATUS_CHARACTER_LIMIT as u16)
                .required(false),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "presence",
                    "Status to set (i.e. Online, Idle, Do Not Disturb or Invisible)",
                )
                .add_string_choice("Online", "Online")
                .add_string_choice("Idle", "Idle")
                .add_string_choice("Do Not Disturb", "Do Not Disturb")
                .add_string_choice("Invisible", "Invisible")
                .required(false),
            ),
    ]
}

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
}

/// Application owners, and team members who may do more than read.
fn may_change_status(user_id: UserId, info: &CurrentApplicationInfo) -> bool {
    match &info.team {
        Some(team) => team
            .members
            .iter()
            .any(|m| m.user.id == user_id && m.role != TeamMemberRole::ReadOnly),
        None => info.owner.as_ref().is_some_and(|owner| owner.id == user_id),
    }
}

async fn edit_reply(ctx: &Context, command: &CommandInteraction, text: &str) {
    if let Err(e) = command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
        .await
    {
        warn!("Failed to answer /{}: {}", command.data.name, e);
    }
}

/// Accepts a bare message id or a message link (the id is its last segment).
pub fn parse_message_reference(text: &str) -> Option<u64> {
    let id = text.trim().trim_end_matches('/').rsplit('/').next()?;
    id.parse::<u64>().ok().filter(|id| *id != 0)
}

async fn reply(ctx: &Context, command: &CommandInteraction, text: &str, ephemeral: bool) {
    if let Err(e) = command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(text)
                    .ephemeral(ephemeral),
            ),
        )
        .await
    {
        warn!("Failed to answer /{}: {}", command.data.name, e);
    }
}

impl Bot {
    pub(super) async fn handle_command(&self, ctx: &Context, command: &CommandInteraction) {
        debug!(
            channel_id = command.channel_id.get(),
            "/{} called by user '{}'", command.data.name, command.user.name
        );
        match command.data.name.as_str() {
            "lobotomize" => self.handle_lobotomize(ctx, command).await,
            "poke" => self.handle_poke(ctx, command).await,
            "unpoke" => self.handle_unpoke(ctx, command).await,
            "say" => self.handle_say(ctx, command).await,
            "edit" => self.handle_edit(ctx, command).await,
            "rewrite" => self.handle_rewrite(ctx, command).await,
            "stop" => self.handle_stop(ctx, command).await,
            "status" => self.handle_status(ctx, command).await,
            _ => {}
        }
    }

    /// Hides history at and before the command's own response, or before
    /// it when the response should stay out of the bot's memory.
    async fn handle_lobotomize(&self, ctx: &Context, command: &CommandInteraction) {
        let channel_id = command.channel_id.get();
        reply(ctx, command, LOBOTOMIZE_RESPONSE, false).await;
        let response = match command.get_response(&ctx.http).await {
            Ok(response) => response,
            Err(e) => {
                warn!(channel_id, "Could not find /lobotomize response: {}", e);
                return;
            }
        };

        let mut hide_from = response.id.get();
        if !self.state.settings.discord.include_lobotomize_response {
            debug!("Excluding bot response from chat history.");
            match self.sink.fetch_history(channel_id, Some(hide_from), 1).await {
                Ok(history) => {
                    if let Some(previous) = history.first() {
                        hide_from = previous.id;
                    }
                }
                Err(e) => warn!(channel_id, "Could not read channel history: {}", e),
            }
        }
        self.state
            .repetition
            .hide_messages_before(channel_id, hide_from);
    }

    async fn handle_poke(&self, ctx: &Context, command: &CommandInteraction) {
        if let Err(e) = command.defer_ephemeral(&ctx.http).await {
            warn!("Failed to defer /poke: {}", e);
            return;
        }

        let requested = string_option(command, "message").map(parse_message_reference);

        let found = match requested {
            Some(Some(id)) => command
                .channel_id
                .message(&ctx.http, MessageId::new(id))
                .await
                .ok(),
            Some(None) => None,
            None => {
                let limit = self.state.settings.discord.history_lines.clamp(1, 100) as u8;
                match command
                    .channel_id
                    .messages(&ctx.http, GetMessages::new().limit(limit))
                    .await
                {
                    Ok(messages) => messages
                        .into_iter()
                        .find(|m| !self.state.engine.is_hidden(&m.content)),
                    Err(e) => {
                        warn!("Could not read channel history: {}", e);
                        None
                    }
                }
            }
        };

        let Some(message) = found else {
            let text = match requested {
                Some(_) => "Could not fetch provided message.".to_string(),
                None => format!(
                    "Can't find a valid message in the last {} messages.",
                    self.state.settings.discord.history_lines
                ),
            };
            edit_reply(ctx, command, &text).await;
            return;
        };

        if let Err(e) = command.delete_response(&ctx.http).await {
            debug!("Could not delete /poke placeholder: {}", e);
        }
        self.poke(convert::chat_message(&message)).await;
    }

    async fn handle_unpoke(&self, ctx: &Context, command: &CommandInteraction) {
        if command.guild_id.is_none() {
            reply(ctx, command, "Can't use /unpoke in a DM.", true).await;
            return;
        }
        self.unpoke(command.guild_id, command.channel_id);
        let text = format!(
            "{} will stay quiet here until summoned again.",
            self.state.settings.persona.ai_name
        );
        reply(ctx, command, &text, true).await;
    }

    fn log_command_mention(&self, command: &CommandInteraction) {
        let channel_id = command.channel_id.get();
        let guild_key = command.guild_id.map_or(channel_id, |guild| guild.get());
        let sent_at = command.id.created_at().unix_timestamp() as f64;
        self.state.engine.log_mention(guild_key, channel_id, sent_at);
    }

    /// With `reply_in_thread`, the bot only speaks in threads and DMs.
    async fn may_speak_in(&self, ctx: &Context, command: &CommandInteraction) -> bool {
        if !self.state.settings.discord.reply_in_thread || command.guild_id.is_none() {
            return true;
        }
        match command.channel_id.to_channel(&ctx.http).await {
            Ok(Channel::Guild(channel)) => matches!(
                channel.kind,
                ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
            ),
            Ok(_) => true,
            Err(e) => {
                warn!("Could not look up channel: {}", e);
                false
            }
        }
    }

    /// The message named by the `message` option, or else the bot's most
    /// recent visible message within the history window.
    async fn find_own_message(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
    ) -> Option<Message> {
        if let Some(requested) = string_option(command, "message") {
            let id = parse_message_reference(requested)?;
            return command
                .channel_id
                .message(&ctx.http, MessageId::new(id))
                .await
                .ok();
        }
        let bot_user_id = self.state.engine.bot_user_id();
        let limit = self.state.settings.discord.history_lines.clamp(1, 100) as u8;
        match command
            .channel_id
            .messages(&ctx.http, GetMessages::new().limit(limit))
            .await
        {
            Ok(messages) => messages.into_iter().find(|m| {
                m.author.id.get() == bot_user_id && !self.state.engine.is_hidden(&m.content)
            }),
            Err(e) => {
                warn!("Could not read channel history: {}", e);
                None
            }
        }
    }

    fn own_message_missing(&self) -> String {
        format!(
            "Can't find my last message in the last {} messages.",
            self.state.settings.discord.history_lines
        )
    }

    async fn handle_say(&self, ctx: &Context, command: &CommandInteraction) {
        let Some(text) = string_option(command, "message") else {
            return;
        };
        if !self.may_speak_in(ctx, command).await {
            reply(ctx, command, "I may only speak in threads.", true).await;
            return;
        }
        self.log_command_mention(command);
        if let Err(e) = command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .flags(InteractionResponseFlags::SUPPRESS_EMBEDS),
                ),
            )
            .await
        {
            warn!("Failed to answer /say: {}", e);
        }
    }

    async fn handle_edit(&self, ctx: &Context, command: &CommandInteraction) {
        let Some(text) = string_option(command, "text") else {
            return;
        };
        if let Err(e) = command.defer_ephemeral(&ctx.http).await {
            warn!("Failed to defer /edit: {}", e);
            return;
        }
        let Some(message) = self.find_own_message(ctx, command).await else {
            edit_reply(ctx, command, &self.own_message_missing()).await;
            return;
        };
        if message.author.id.get() != self.state.engine.bot_user_id() {
            edit_reply(ctx, command, "I can only edit my own messages.").await;
            return;
        }

        self.log_command_mention(command);
        let channel_id = command.channel_id.get();
        if let Err(e) = self.sink.edit(channel_id, message.id.get(), text).await {
            error!(channel_id, "Could not edit message: {}", e);
            edit_reply(ctx, command, &format!("Something went wrong! {e}")).await;
            return;
        }
        if let Err(e) = command.delete_response(&ctx.http).await {
            debug!("Could not delete /edit placeholder: {}", e);
        }
    }

    async fn handle_rewrite(&self, ctx: &Context, command: &CommandInteraction) {
        let Some(instruction) = string_option(command, "instruction") else {
            return;
        };
        if let Err(e) = command.defer_ephemeral(&ctx.http).await {
            warn!("Failed to defer /rewrite: {}", e);
            return;
        }
        let Some(message) = self.find_own_message(ctx, command).await else {
            edit_reply(ctx, command, &self.own_message_missing()).await;
            return;
        };
        if message.author.id.get() != self.state.engine.bot_user_id() {
            edit_reply(ctx, command, "I can only rewrite my own messages.").await;
            return;
        }

        self.log_command_mention(command);
        if let Err(e) = command.delete_response(&ctx.http).await {
            debug!("Could not delete /rewrite placeholder: {}", e);
        }
        let channel_id = command.channel_id.get();
        let message_id = message.id.get();
        debug!(
            channel_id,
            message_id, "Received message rewrite request from user '{}'", command.user.name
        );
        let replied_to = message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(MessageId::get);
        if let Err(e) = self
            .state
            .pipeline
            .regenerate(channel_id, message_id, replied_to, Some(instruction))
            .await
        {
            error!(channel_id, message_id, "Error while rewriting response: {}", e);
            self.state.stats.log_failure();
        }
    }

    async fn handle_status(&self, ctx: &Context, command: &CommandInteraction) {
        match ctx.http.get_current_application_info().await {
            Ok(info) if may_change_status(command.user.id, &info) => {}
            Ok(info) => {
                let text = if info.team.is_some() {
                    "Only a non-read only team member can use this command."
                } else {
                    "Only the bot owner can use this command."
                };
                reply(ctx, command, text, true).await;
                return;
            }
            Err(e) => {
                warn!("Could not read application info: {}", e);
                reply(ctx, command, &format!("Something went wrong! {e}"), true).await;
                return;
            }
        }

        let status = string_option(command, "presence").and_then(parse_status);
        self.presence.set(string_option(command, "text"), status);
        let text = format!("{}'s status updated.", self.state.settings.persona.ai_name);
        reply(ctx, command, &text, true).await;
    }

    async fn handle_stop(&self, ctx: &Context, command: &CommandInteraction) {
        let text = if self.state.queue.stop_responding(command.channel_id.get()) {
            format!(
                "{} stopped typing.",
                self.state.settings.persona.ai_name
            )
        } else {
            "Nothing to stop.".to_string()
        };
        reply(ctx, command, &text, true).await;
    }
}
