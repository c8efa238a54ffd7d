//! Deciding whether, and how directly, the bot should answer a message.

pub mod chance;
pub mod engine;
pub mod mentions;

pub use chance::{RandomSource, ResponseChanceModel, ThreadRandom, VoiceAttention};
pub use engine::{Decision, ResponseDecisionEngine};
pub use mentions::MentionTracker;
