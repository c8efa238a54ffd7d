//! Time-since-mention response chances for text and voice channels.

use std::sync::{Arc, Mutex, PoisonError};

use oobabot_core::SettingsError;
use oobabot_core::config::{ChanceTable, validate_chance_table};
use rand::Rng;
use tracing::debug;

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Linearly interpolates the response chance for `elapsed` seconds.
///
/// Before the first threshold the first chance applies. Past the last
/// threshold the result is 0. An empty table always responds.
pub fn interpolate(elapsed: f64, table: &[(f64, f64)]) -> f64 {
    let Some(&(_, first_chance)) = table.first() else {
        return 1.0;
    };

    let mut duration = 0.0;
    let mut chance = first_chance;
    for &(next_duration, next_chance) in table {
        if duration <= elapsed && elapsed <= next_duration {
            let span = next_duration - duration;
            if span <= 0.0 {
                return next_chance;
            }
            return chance + (next_chance - chance) * (elapsed - duration) / span;
        }
        duration = next_duration;
        chance = next_chance;
    }
    0.0
}

/// Decides unsolicited replies from how long ago the bot was last addressed.
pub struct ResponseChanceModel {
    text_table: ChanceTable,
    voice_table: ChanceTable,
    interrobang_bonus: f64,
    random: Arc<dyn RandomSource>,
}

impl ResponseChanceModel {
    /// Tables are rejected unless thresholds are non-negative and strictly
    /// increasing, which also rules out a zero-width interpolation span.
    pub fn new(
        text_table: ChanceTable,
        voice_table: ChanceTable,
        interrobang_bonus: f64,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, SettingsError> {
        validate_chance_table("time_vs_response_chance", &text_table)?;
        validate_chance_table("voice_time_vs_response_chance", &voice_table)?;
        Ok(Self {
            text_table,
            voice_table,
            interrobang_bonus,
            random,
        })
    }

    /// Largest text threshold; mentions older than this can never matter.
    pub fn cache_timeout(&self) -> f64 {
        self.text_table
            .last()
            .map(|&(duration, _)| duration)
            .unwrap_or(f64::INFINITY)
    }

    /// Chance of an unsolicited text reply, including the `?`/`!` bonus.
    pub fn text_chance(&self, elapsed: f64, ends_with_interrobang: bool) -> f64 {
        let chance = interpolate(elapsed, &self.text_table);
        if chance <= 0.0 {
            return 0.0;
        }
        let bonus = if ends_with_interrobang {
            self.interrobang_bonus
        } else {
            0.0
        };
        (chance + bonus).clamp(0.0, 1.0)
    }

    /// Rolls for an unsolicited text reply. Returns the outcome and the
    /// chance that was rolled against.
    pub fn unsolicited_response(&self, elapsed: f64, ends_with_interrobang: bool) -> (bool, f64) {
        let chance = self.text_chance(elapsed, ends_with_interrobang);
        debug!(
            elapsed_seconds = elapsed,
            chance_percent = chance * 100.0,
            "Considering unsolicited response"
        );
        (self.roll(chance), chance)
    }

    /// Voice variant. `participants` counts the other people in the call.
    ///
    /// A one-on-one call always gets a reply. Otherwise the table chance (or
    /// the last entry's chance once the table runs out) is divided by the
    /// number of participants, capped at three.
    pub fn voice_response(&self, elapsed: f64, participants: usize) -> (bool, f64) {
        if participants == 1 {
            return (true, 1.0);
        }
        let mut chance = interpolate(elapsed, &self.voice_table);
        if chance <= 0.0 {
            chance = self.voice_table.last().map(|&(_, c)| c).unwrap_or(1.0);
        }
        chance /= participants.clamp(1, 3) as f64;
        (self.roll(chance), chance)
    }

    fn roll(&self, chance: f64) -> bool {
        chance > 0.0 && self.random.next_f64() < chance
    }
}

/// Tracks when the bot was last addressed in a voice call.
///
/// Transcription itself happens elsewhere; this only turns "someone said
/// something" into a yes/no using the voice table.
pub struct VoiceAttention {
    model: Arc<ResponseChanceModel>,
    last_addressed: Mutex<Option<f64>>,
}

impl VoiceAttention {
    pub fn new(model: Arc<ResponseChanceModel>) -> Self {
        Self {
            model,
            last_addressed: Mutex::new(None),
        }
    }

    pub fn log_addressed(&self, timestamp: f64) {
        *self.last_addressed.lock().unwrap_or_else(PoisonError::into_inner) = Some(timestamp);
    }

    /// Decide on an utterance heard at `timestamp`. Being addressed by name
    /// always answers and restarts the clock.
    pub fn should_respond(&self, timestamp: f64, participants: usize, addressed: bool) -> bool {
        if addressed {
            self.log_addressed(timestamp);
            return true;
        }
        let last = *self.last_addressed.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            Some(last) => self.model.voice_response(timestamp - last, participants).0,
            None => participants == 1,
        }
    }
}

#[cfg(test)]
pub(crate) struct FixedRandom(pub f64);

#[cfg(test)]
impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(draw: f64) -> ResponseChanceModel {
        ResponseChanceModel::new(
            vec![(60.0, 0.9), (180.0, 0.5)],
            vec![(30.0, 0.95), (60.0, 0.90), (180.0, 0.85)],
            0.3,
            Arc::new(FixedRandom(draw)),
        )
        .unwrap()
    }

    #[test]
    fn interpolates_linearly() {
        let table = [(60.0, 0.9), (180.0, 0.5)];
        assert!((interpolate(0.0, &table) - 0.9).abs() < 1e-9);
        assert!((interpolate(60.0, &table) - 0.9).abs() < 1e-9);
        assert!((interpolate(120.0, &table) - 0.7).abs() < 1e-9);
        assert!((interpolate(180.0, &table) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn past_last_threshold_is_zero() {
        assert_eq!(interpolate(181.0, &[(60.0, 0.9), (180.0, 0.5)]), 0.0);
    }

    #[test]
    fn empty_table_always_responds() {
        assert_eq!(interpolate(10_000.0, &[]), 1.0);
    }

    #[test]
    fn table_starting_at_zero() {
        let table = [(0.0, 1.0), (100.0, 0.0)];
        assert_eq!(interpolate(0.0, &table), 1.0);
        assert!((interpolate(25.0, &table) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn rejects_unsorted_tables() {
        let result = ResponseChanceModel::new(
            vec![(180.0, 0.5), (60.0, 0.9)],
            vec![],
            0.0,
            Arc::new(ThreadRandom),
        );
        assert!(result.is_err());
    }

    #[test]
    fn interrobang_bonus_is_clamped() {
        let model = model(0.0);
        assert!((model.text_chance(120.0, true) - 1.0).abs() < 1e-9);
        assert!((model.text_chance(180.0, true) - 0.8).abs() < 1e-9);
        assert_eq!(model.text_chance(500.0, true), 0.0);
    }

    #[test]
    fn draw_is_compared_against_chance() {
        assert!(model(0.69).unsolicited_response(120.0, false).0);
        assert!(!model(0.71).unsolicited_response(120.0, false).0);
        assert!(!model(0.0).unsolicited_response(1_000.0, false).0);
    }

    #[test]
    fn voice_one_on_one_is_guaranteed() {
        let model = model(0.999);
        assert_eq!(model.voice_response(0.0, 1), (true, 1.0));
        assert_eq!(model.voice_response(100_000.0, 1), (true, 1.0));
    }

    #[test]
    fn voice_falls_back_to_last_chance() {
        let (_, chance) = model(0.0).voice_response(10_000.0, 2);
        assert!((chance - 0.85 / 2.0).abs() < 1e-9);
    }

    #[test]
    fn voice_divisor_is_capped_at_three() {
        let (_, five) = model(0.0).voice_response(0.0, 5);
        let (_, three) = model(0.0).voice_response(0.0, 3);
        assert!((five - three).abs() < 1e-9);
        assert!((three - 0.95 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn voice_attention_restarts_clock_when_addressed() {
        let attention = VoiceAttention::new(Arc::new(model(0.4)));
        assert!(!attention.should_respond(0.0, 2, false));
        assert!(attention.should_respond(10.0, 2, true));
        // 0.95 / 2 > 0.4
        assert!(attention.should_respond(20.0, 2, false));
    }
}
