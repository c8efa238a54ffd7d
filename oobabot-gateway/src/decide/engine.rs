//! The respond-or-not state machine for a single incoming message.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use oobabot_core::{ChannelId, ChatMessage, GuildId, MessageId, Settings, SettingsError, UserId};
use regex::Regex;
use tracing::debug;

use super::chance::{RandomSource, ResponseChanceModel};
use super::mentions::MentionTracker;

/// Outcome of evaluating one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub respond: bool,
    /// Direct messages, @-mentions and wakewords. Guaranteed responses are
    /// not direct mentions.
    pub is_direct_mention: bool,
}

impl Decision {
    pub const IGNORE: Self = Self {
        respond: false,
        is_direct_mention: false,
    };
    pub const DIRECT: Self = Self {
        respond: true,
        is_direct_mention: true,
    };
    pub const UNSOLICITED: Self = Self {
        respond: true,
        is_direct_mention: false,
    };
}

#[derive(Debug)]
struct DecisionState {
    mentions: MentionTracker,
    /// Per channel, messages that must be answered. Empty sets are removed.
    guarantees: HashMap<ChannelId, HashSet<MessageId>>,
}

/// Decides whether the bot answers a message.
///
/// Evaluation never suspends: every method takes the internal lock once and
/// returns. The engine never logs mentions itself because the reply may land
/// in a different channel (a new thread) than the one the message came from.
pub struct ResponseDecisionEngine {
    bot_user_id: AtomicU64,
    ignore_dms: bool,
    ignore_bots: bool,
    ignore_prefixes: Vec<String>,
    disable_unsolicited_replies: bool,
    wakewords: Vec<Regex>,
    chance: Arc<ResponseChanceModel>,
    state: Mutex<DecisionState>,
}

impl ResponseDecisionEngine {
    pub fn new(settings: &Settings, random: Arc<dyn RandomSource>) -> Result<Self, SettingsError> {
        let discord = &settings.discord;
        let chance = Arc::new(ResponseChanceModel::new(
            discord.time_vs_response_chance.clone(),
            discord.voice_time_vs_response_chance.clone(),
            discord.interrobang_bonus,
            random,
        )?);

        let mut wakewords = Vec::with_capacity(settings.persona.wakewords.len());
        for word in &settings.persona.wakewords {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
            let re = Regex::new(&pattern)
                .map_err(|e| SettingsError::Invalid(format!("wakeword {word:?}: {e}")))?;
            wakewords.push(re);
        }

        Ok(Self {
            bot_user_id: AtomicU64::new(0),
            ignore_dms: discord.ignore_dms,
            ignore_bots: discord.ignore_bots,
            ignore_prefixes: discord.ignore_prefixes.clone(),
            disable_unsolicited_replies: discord.disable_unsolicited_replies,
            wakewords,
            state: Mutex::new(DecisionState {
                mentions: MentionTracker::new(chance.cache_timeout(), discord.unsolicited_channel_cap),
                guarantees: HashMap::new(),
            }),
            chance,
        })
    }

    fn state(&self) -> MutexGuard<'_, DecisionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set once the platform connection knows who we are.
    pub fn set_bot_user_id(&self, id: UserId) {
        self.bot_user_id.store(id, Ordering::Relaxed);
    }

    pub fn bot_user_id(&self) -> UserId {
        self.bot_user_id.load(Ordering::Relaxed)
    }

    pub fn chance_model(&self) -> &Arc<ResponseChanceModel> {
        &self.chance
    }

    /// Body starts with one of the configured hidden prefixes.
    pub fn is_hidden(&self, text: &str) -> bool {
        self.ignore_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && text.starts_with(prefix.as_str()))
    }

    pub fn contains_wakeword(&self, text: &str) -> bool {
        self.wakewords.iter().any(|re| re.is_match(text))
    }

    /// Other bots (when ignored), ourselves, and hidden messages.
    pub fn should_ignore(&self, message: &ChatMessage) -> bool {
        if message.author_is_bot && self.ignore_bots {
            return true;
        }
        let me = self.bot_user_id();
        if me != 0 && message.author_id == me {
            return true;
        }
        self.is_hidden(&message.body_text)
    }

    pub fn is_directly_mentioned(&self, message: &ChatMessage) -> bool {
        if message.is_direct_message {
            return !self.ignore_dms;
        }
        let me = self.bot_user_id();
        if me != 0 && message.mentions.contains(&me) {
            return true;
        }
        self.contains_wakeword(&message.body_text)
    }

    /// Evaluates a message. A guarantee for the message is consumed here.
    pub fn should_respond(&self, message: &ChatMessage) -> Decision {
        if self.consume_guarantee(message.channel_id, message.id) {
            debug!(message_id = message.id, "Responding to guaranteed message");
            return Decision::UNSOLICITED;
        }
        if self.should_ignore(message) {
            return Decision::IGNORE;
        }
        if self.is_directly_mentioned(message) {
            return Decision::DIRECT;
        }
        if !message.is_direct_message && self.unsolicited_reply(message) {
            return Decision::UNSOLICITED;
        }
        Decision::IGNORE
    }

    fn unsolicited_reply(&self, message: &ChatMessage) -> bool {
        // someone else was @-mentioned instead of us
        let me = self.bot_user_id();
        if !message.mentions.is_empty() && !message.mentions.contains(&me) {
            return false;
        }
        if self.disable_unsolicited_replies {
            return false;
        }

        let elapsed = {
            let mut state = self.state();
            let elapsed = state.mentions.time_since_last_mention(message);
            if state
                .mentions
                .is_cooling(message.guild_key(), message.channel_id)
            {
                return false;
            }
            elapsed
        };
        let Some(elapsed) = elapsed else {
            return false;
        };

        self.chance
            .unsolicited_response(elapsed, message.ends_with_interrobang())
            .0
    }

    fn consume_guarantee(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        let mut state = self.state();
        let Some(set) = state.guarantees.get_mut(&channel_id) else {
            return false;
        };
        let found = set.remove(&message_id);
        if set.is_empty() {
            state.guarantees.remove(&channel_id);
        }
        found
    }

    /// Forces a reply to `message_id` the next time it is evaluated.
    pub fn guarantee_response(&self, channel_id: ChannelId, message_id: MessageId) {
        self.state()
            .guarantees
            .entry(channel_id)
            .or_default()
            .insert(message_id);
    }

    pub fn is_guaranteed(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        self.state()
            .guarantees
            .get(&channel_id)
            .is_some_and(|set| set.contains(&message_id))
    }

    pub fn guarantee_count(&self, channel_id: ChannelId) -> usize {
        self.state().guarantees.get(&channel_id).map_or(0, HashSet::len)
    }

    /// Drops every guarantee in the channel except `keep`, which survives
    /// only if it was already guaranteed.
    pub fn retain_guarantee(&self, channel_id: ChannelId, keep: MessageId) {
        let mut state = self.state();
        let kept = state
            .guarantees
            .get(&channel_id)
            .is_some_and(|set| set.contains(&keep));
        if kept {
            state.guarantees.insert(channel_id, HashSet::from([keep]));
        } else {
            state.guarantees.remove(&channel_id);
        }
    }

    pub fn purge_guarantees(&self, channel_id: ChannelId) {
        self.state().guarantees.remove(&channel_id);
    }

    pub fn log_mention(&self, guild_id: GuildId, channel_id: ChannelId, timestamp: f64) {
        self.state()
            .mentions
            .log_mention(guild_id, channel_id, timestamp);
    }

    pub fn log_cooldown(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.state().mentions.set_cooldown(guild_id, channel_id);
    }

    pub fn is_cooling(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        self.state().mentions.is_cooling(guild_id, channel_id)
    }
}
