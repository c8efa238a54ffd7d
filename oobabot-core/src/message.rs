use serde::{Deserialize, Serialize};

/// Platform snowflake of a channel (or thread).
pub type ChannelId = u64;
/// Platform snowflake of a message.
pub type MessageId = u64;
/// Platform snowflake of a user or bot account.
pub type UserId = u64;
/// Platform snowflake of a guild (server).
pub type GuildId = u64;

/// Normalized inbound chat message.
///
/// The Discord adapter converts gateway events into this record; everything
/// downstream (decision engine, queue, response pipeline) only sees this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    /// `None` for direct messages.
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
    /// Display name, already resolved by the adapter.
    pub author_name: String,
    pub author_is_bot: bool,
    pub body_text: String,
    /// Send time reported by the platform, seconds since the epoch.
    pub send_timestamp: f64,
    /// Users explicitly @-mentioned in the message.
    #[serde(default)]
    pub mentions: Vec<UserId>,
    pub is_direct_message: bool,
    /// Message this one replies to, if any.
    #[serde(default)]
    pub reference_message_id: Option<MessageId>,
    /// Attachment URLs (images only).
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl ChatMessage {
    /// True when there is nothing to respond to.
    pub fn is_empty(&self) -> bool {
        self.body_text.trim().is_empty()
    }

    /// Key used for per-guild bookkeeping. Direct messages have no guild,
    /// so each DM channel acts as its own guild.
    pub fn guild_key(&self) -> GuildId {
        self.guild_id.unwrap_or(self.channel_id)
    }

    pub fn ends_with_interrobang(&self) -> bool {
        let trimmed = self.body_text.trim_end();
        trimmed.ends_with('?') || trimmed.ends_with('!')
    }
}

/// A message as seen in channel history, used to build prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub author_is_bot: bool,
    pub body_text: String,
    pub send_timestamp: f64,
    /// True when the message carries only non-text content (e.g. an image).
    #[serde(default)]
    pub is_attachment_only: bool,
    /// Someone marked the message as not for the bot (e.g. a rewind reaction).
    #[serde(default)]
    pub hidden_by_reaction: bool,
}

impl From<&ChatMessage> for HistoryMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            author_id: message.author_id,
            author_name: message.author_name.clone(),
            author_is_bot: message.author_is_bot,
            body_text: message.body_text.clone(),
            send_timestamp: message.send_timestamp,
            is_attachment_only: false,
            hidden_by_reaction: false,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_message(id: MessageId, body: &str) -> ChatMessage {
    ChatMessage {
        id,
        channel_id: 10,
        guild_id: Some(1),
        author_id: 100,
        author_name: "alice".to_string(),
        author_is_bot: false,
        body_text: body.to_string(),
        send_timestamp: 1_000.0,
        mentions: Vec::new(),
        is_direct_message: false,
        reference_message_id: None,
        attachments: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guild_key_falls_back_to_channel() {
        let mut message = sample_message(1, "hi");
        assert_eq!(message.guild_key(), 1);
        message.guild_id = None;
        assert_eq!(message.guild_key(), 10);
    }

    #[test]
    fn interrobang_ignores_trailing_whitespace() {
        assert!(sample_message(1, "really?  ").ends_with_interrobang());
        assert!(sample_message(1, "wow!").ends_with_interrobang());
        assert!(!sample_message(1, "ok.").ends_with_interrobang());
    }

    #[test]
    fn whitespace_only_message_is_empty() {
        assert!(sample_message(1, "  \n").is_empty());
        assert!(!sample_message(1, "a").is_empty());
    }

    #[test]
    fn message_json_defaults() {
        let json = r#"{
            "id": 5, "channel_id": 6, "guild_id": null, "author_id": 7,
            "author_name": "bob", "author_is_bot": false, "body_text": "hey",
            "send_timestamp": 12.5, "is_direct_message": true
        }"#;
        let message: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(message.mentions.is_empty());
        assert!(message.attachments.is_empty());
        assert_eq!(message.reference_message_id, None);
        assert_eq!(message.guild_key(), 6);
    }
}
