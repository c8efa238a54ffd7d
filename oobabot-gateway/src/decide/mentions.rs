//! Per-guild record of when the bot was last addressed in each channel.
//!
//! Timestamps come from the messages themselves, not the local clock, so a
//! delayed or replayed batch of messages is judged the same way every time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use oobabot_core::{ChannelId, ChatMessage, GuildId};

/// Mention times for the channels of one guild.
#[derive(Debug, Clone, Default)]
struct LastMentionTimes {
    times: BTreeMap<ChannelId, f64>,
    /// Always a subset of `times`' keys.
    cooldowns: BTreeSet<ChannelId>,
}

impl LastMentionTimes {
    /// Drops entries older than `cache_timeout` before `latest`, then, when
    /// `cap` is set, keeps only the `cap` most recently mentioned channels.
    /// Returns false once nothing is left.
    fn purge_outdated(&mut self, latest: f64, cache_timeout: f64, cap: usize) -> bool {
        let mut oldest_to_keep = latest - cache_timeout;
        if cap > 0 && self.times.len() > cap {
            let mut stamps: Vec<f64> = self.times.values().copied().collect();
            stamps.sort_by(f64::total_cmp);
            let nth_newest = stamps[stamps.len() - cap];
            oldest_to_keep = oldest_to_keep.max(nth_newest);
        }
        self.times.retain(|_, stamp| *stamp >= oldest_to_keep);
        let times = &self.times;
        self.cooldowns.retain(|channel| times.contains_key(channel));
        !self.times.is_empty()
    }

    fn log_mention(&mut self, channel_id: ChannelId, timestamp: f64) {
        self.times.insert(channel_id, timestamp);
        self.cooldowns.remove(&channel_id);
    }
}

/// Tracks mentions for every guild the bot has been addressed in.
#[derive(Debug, Clone)]
pub struct MentionTracker {
    guilds: HashMap<GuildId, LastMentionTimes>,
    cache_timeout: f64,
    channel_cap: usize,
}

impl MentionTracker {
    /// `channel_cap` of 0 means unlimited.
    pub fn new(cache_timeout: f64, channel_cap: usize) -> Self {
        Self {
            guilds: HashMap::new(),
            cache_timeout,
            channel_cap,
        }
    }

    /// Records a mention and lifts any cooldown on the channel.
    pub fn log_mention(&mut self, guild_id: GuildId, channel_id: ChannelId, timestamp: f64) {
        self.guilds
            .entry(guild_id)
            .or_default()
            .log_mention(channel_id, timestamp);
    }

    /// Seconds since the last mention in the message's channel, measured
    /// from the message's own send time. Purges stale entries first.
    pub fn time_since_last_mention(&mut self, message: &ChatMessage) -> Option<f64> {
        let latest = message.send_timestamp;
        let (timeout, cap) = (self.cache_timeout, self.channel_cap);
        self.guilds
            .retain(|_, times| times.purge_outdated(latest, timeout, cap));

        self.guilds
            .get(&message.guild_key())
            .and_then(|times| times.times.get(&message.channel_id))
            .map(|last| latest - last)
    }

    /// Silences a channel until its next logged mention. Channels that are
    /// not being tracked have nothing to silence.
    pub fn set_cooldown(&mut self, guild_id: GuildId, channel_id: ChannelId) {
        if let Some(times) = self.guilds.get_mut(&guild_id) {
            if times.times.contains_key(&channel_id) {
                times.cooldowns.insert(channel_id);
            }
        }
    }

    pub fn is_cooling(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        self.guilds
            .get(&guild_id)
            .is_some_and(|times| times.cooldowns.contains(&channel_id))
    }

    /// Number of channels tracked in a guild.
    pub fn tracked_channels(&self, guild_id: GuildId) -> usize {
        self.guilds.get(&guild_id).map_or(0, |times| times.times.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_at(channel_id: ChannelId, timestamp: f64) -> ChatMessage {
        ChatMessage {
            id: 1,
            channel_id,
            guild_id: Some(7),
            author_id: 2,
            author_name: "alice".to_string(),
            author_is_bot: false,
            body_text: "hello".to_string(),
            send_timestamp: timestamp,
            mentions: Vec::new(),
            is_direct_message: false,
            reference_message_id: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn reports_elapsed_from_message_time() {
        let mut tracker = MentionTracker::new(600.0, 0);
        tracker.log_mention(7, 10, 1_000.0);
        assert_eq!(
            tracker.time_since_last_mention(&message_at(10, 1_120.0)),
            Some(120.0)
        );
        assert_eq!(tracker.time_since_last_mention(&message_at(11, 1_120.0)), None);
    }

    #[test]
    fn purge_is_idempotent() {
        let mut tracker = MentionTracker::new(600.0, 2);
        tracker.log_mention(7, 10, 1_000.0);
        tracker.log_mention(7, 11, 1_100.0);
        let message = message_at(10, 1_300.0);

        let first = tracker.time_since_last_mention(&message);
        let second = tracker.time_since_last_mention(&message);
        assert_eq!(first, Some(300.0));
        assert_eq!(first, second);
        assert_eq!(tracker.tracked_channels(7), 2);
    }

    #[test]
    fn stale_entries_are_dropped() {
        let mut tracker = MentionTracker::new(600.0, 0);
        tracker.log_mention(7, 10, 1_000.0);
        assert_eq!(tracker.time_since_last_mention(&message_at(10, 1_601.0)), None);
        assert_eq!(tracker.tracked_channels(7), 0);
    }

    #[test]
    fn cap_keeps_most_recent_channels() {
        let mut tracker = MentionTracker::new(600.0, 2);
        tracker.log_mention(7, 10, 1_000.0);
        tracker.log_mention(7, 11, 1_010.0);
        tracker.log_mention(7, 12, 1_020.0);

        assert_eq!(tracker.time_since_last_mention(&message_at(10, 1_030.0)), None);
        assert_eq!(
            tracker.time_since_last_mention(&message_at(12, 1_030.0)),
            Some(10.0)
        );
        assert_eq!(tracker.tracked_channels(7), 2);
    }

    #[test]
    fn cooldown_cleared_by_mention() {
        let mut tracker = MentionTracker::new(600.0, 0);
        tracker.set_cooldown(7, 10);
        assert!(!tracker.is_cooling(7, 10), "untracked channels never cool");

        tracker.log_mention(7, 10, 1_000.0);
        tracker.set_cooldown(7, 10);
        assert!(tracker.is_cooling(7, 10));

        tracker.log_mention(7, 10, 1_050.0);
        assert!(!tracker.is_cooling(7, 10));
    }

    #[test]
    fn cooldown_dropped_with_purged_channel() {
        let mut tracker = MentionTracker::new(600.0, 0);
        tracker.log_mention(7, 10, 1_000.0);
        tracker.set_cooldown(7, 10);
        tracker.time_since_last_mention(&message_at(10, 5_000.0));
        assert!(!tracker.is_cooling(7, 10));
    }
}
