//! Notices when the bot keeps posting the same thing in a channel and hides
//! the repeated part of the history from the next prompt.
//!
//! Also holds the explicit "forget everything before here" markers set by
//! `/lobotomize` or the rewind reaction. Both kinds of marker feed the same
//! stop-before point in history retrieval but are tracked separately.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use oobabot_core::{ChannelId, MessageId};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct RepetitionState {
    /// `None` until the bot has posted in the channel.
    last_canonical_text: Option<String>,
    throttle_message_id: Option<MessageId>,
    consecutive_repeats: u32,
}

#[derive(Debug, Default)]
struct Channels {
    repetition: HashMap<ChannelId, RepetitionState>,
    history_markers: HashMap<ChannelId, MessageId>,
}

pub struct RepetitionTracker {
    threshold: u32,
    similarity_threshold: f64,
    channels: Mutex<Channels>,
}

/// How a new message compared to the previous one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Repetition {
    None,
    Exact,
    /// Token-set similarity at or above the configured threshold.
    Similar(f64),
}

impl Repetition {
    pub fn is_repeat(self) -> bool {
        !matches!(self, Repetition::None)
    }
}

impl RepetitionTracker {
    /// `threshold` of 0 disables throttling; `similarity_threshold` of 0
    /// only counts exact repeats.
    pub fn new(threshold: u32, similarity_threshold: f64) -> Self {
        Self {
            threshold,
            similarity_threshold,
            channels: Mutex::new(Channels::default()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn should_throttle(&self, repeats: u32) -> bool {
        repeats > 0 && self.threshold > 0 && repeats >= self.threshold
    }

    fn compare(&self, previous: Option<&str>, text: &str) -> Repetition {
        let Some(previous) = previous else {
            return Repetition::None;
        };
        if previous == text {
            return Repetition::Exact;
        }
        if self.similarity_threshold > 0.0 {
            let score = token_set_ratio(previous, text);
            if score >= self.similarity_threshold {
                return Repetition::Similar(score);
            }
        }
        Repetition::None
    }

    /// How `text` compares to the last message the bot posted in the
    /// channel. Does not change any state.
    pub fn compare_to_last(&self, channel_id: ChannelId, text: &str) -> Repetition {
        let canonical = canonicalize(text);
        let channels = self.channels();
        let previous = channels
            .repetition
            .get(&channel_id)
            .and_then(|state| state.last_canonical_text.as_deref());
        self.compare(previous, &canonical)
    }

    /// Would posting `text` repeat the last message in the channel?
    pub fn is_repetition(&self, channel_id: ChannelId, text: &str) -> bool {
        self.compare_to_last(channel_id, text).is_repeat()
    }

    /// Records a message the bot just posted.
    pub fn log_message(&self, channel_id: ChannelId, message_id: MessageId, text: &str) {
        let canonical = canonicalize(text);
        let mut channels = self.channels();
        let state = channels.repetition.entry(channel_id).or_default();

        let repetition = self.compare(state.last_canonical_text.as_deref(), &canonical);
        state.consecutive_repeats = if repetition.is_repeat() {
            state.consecutive_repeats + 1
        } else {
            0
        };
        if state.consecutive_repeats > 0 {
            debug!(
                channel_id,
                count = state.consecutive_repeats,
                "Repetition count updated"
            );
        }

        if self.should_throttle(state.consecutive_repeats) {
            match repetition {
                Repetition::Similar(score) => warn!(
                    channel_id,
                    "Repetition found (similarity score: {score:.2}), will throttle history in next request"
                ),
                _ => warn!(
                    channel_id,
                    "Repetition found (exact match), will throttle history in next request"
                ),
            }
            state.throttle_message_id = Some(message_id);
        }
        state.last_canonical_text = Some(canonical);
    }

    /// The active throttle marker. Only set once the repeat streak actually
    /// reaches the threshold.
    pub fn get_throttle_message_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        let channels = self.channels();
        let state = channels.repetition.get(&channel_id)?;
        if self.should_throttle(state.consecutive_repeats) {
            state.throttle_message_id
        } else {
            None
        }
    }

    /// Forgets all repetition state for the channel. Returns whether there was any.
    pub fn clear_throttle_message_id(&self, channel_id: ChannelId) -> bool {
        self.channels().repetition.remove(&channel_id).is_some()
    }

    pub fn hide_messages_before(&self, channel_id: ChannelId, message_id: MessageId) {
        info!(channel_id, message_id, "Hiding messages before message");
        self.channels().history_markers.insert(channel_id, message_id);
    }

    pub fn get_history_marker_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.channels().history_markers.get(&channel_id).copied()
    }

    pub fn clear_history_marker_id(&self, channel_id: ChannelId) -> bool {
        self.channels().history_markers.remove(&channel_id).is_some()
    }

    /// Where history retrieval stops: the throttle marker if active,
    /// otherwise the history marker.
    pub fn stop_before(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.get_throttle_message_id(channel_id)
            .or_else(|| self.get_history_marker_id(channel_id))
    }
}

fn canonicalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Word-set similarity in `[0, 1]`, insensitive to word order and to
/// words present in only one of the strings being a subset of the other.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> BTreeSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    };
    let (left, right) = (tokens(a), tokens(b));
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let join = |set: Vec<&String>| set.into_iter().map(String::as_str).collect::<Vec<_>>().join(" ");
    let intersection = join(left.intersection(&right).collect());
    let only_left = join(left.difference(&right).collect());
    let only_right = join(right.difference(&left).collect());

    let combine = |rest: &str| format!("{intersection} {rest}").trim().to_string();
    let with_left = combine(&only_left);
    let with_right = combine(&only_right);

    [
        ratio(&intersection, &with_left),
        ratio(&intersection, &with_right),
        ratio(&with_left, &with_right),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(a, b)
}
