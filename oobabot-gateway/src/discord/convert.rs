//! serenity messages to the normalized records the core works with.

use oobabot_core::{ChatMessage, HistoryMessage};
use serenity::model::channel::{Message, ReactionType};
use serenity::model::user::User;

/// Discord's epoch, in milliseconds since the Unix epoch.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in a snowflake, in seconds since the Unix epoch.
pub fn snowflake_timestamp(id: u64) -> f64 {
    ((id >> 22) + DISCORD_EPOCH_MS) as f64 / 1000.0
}

/// Replaces `<@id>` codes with `@name` for every user in `users`. Codes for
/// unknown users are left alone.
pub fn replace_mentions(text: &str, users: &[(u64, String)]) -> String {
    let mut text = text.to_string();
    for (id, name) in users {
        let name = format!("@{name}");
        // `<@!id>` is the legacy nickname form
        text = text
            .replace(&format!("<@{id}>"), &name)
            .replace(&format!("<@!{id}>"), &name);
    }
    text
}

pub fn user_display_name(user: &User) -> String {
    user.global_name.clone().unwrap_or_else(|| user.name.clone())
}

/// Guild nickname first, then the global display name, then the username.
pub fn author_name(message: &Message) -> String {
    message
        .member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .unwrap_or_else(|| user_display_name(&message.author))
}

pub fn emoji_name(reaction: &ReactionType) -> Option<&str> {
    match reaction {
        ReactionType::Unicode(name) => Some(name.as_str()),
        ReactionType::Custom { name, .. } => name.as_deref(),
        _ => None,
    }
}

fn body_text(message: &Message) -> String {
    let users: Vec<(u64, String)> = message
        .mentions
        .iter()
        .map(|user| (user.id.get(), user_display_name(user)))
        .collect();
    replace_mentions(&message.content, &users)
}

fn image_urls(message: &Message) -> Vec<String> {
    message
        .attachments
        .iter()
        .filter(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|kind| kind.starts_with("image/"))
        })
        .map(|a| a.url.clone())
        .collect()
}

pub fn chat_message(message: &Message) -> ChatMessage {
    ChatMessage {
        id: message.id.get(),
        channel_id: message.channel_id.get(),
        guild_id: message.guild_id.map(|id| id.get()),
        author_id: message.author.id.get(),
        author_name: author_name(message),
        author_is_bot: message.author.bot,
        body_text: body_text(message),
        send_timestamp: snowflake_timestamp(message.id.get()),
        mentions: message.mentions.iter().map(|user| user.id.get()).collect(),
        is_direct_message: message.guild_id.is_none(),
        reference_message_id: message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.get()),
        attachments: image_urls(message),
    }
}

pub fn history_message(message: &Message, hidden_by_reaction: bool) -> HistoryMessage {
    let body_text = body_text(message);
    HistoryMessage {
        id: message.id.get(),
        author_id: message.author.id.get(),
        author_name: author_name(message),
        author_is_bot: message.author.bot,
        is_attachment_only: body_text.trim().is_empty() && !message.attachments.is_empty(),
        body_text,
        send_timestamp: snowflake_timestamp(message.id.get()),
        hidden_by_reaction,
    }
}
