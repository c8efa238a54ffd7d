//! Sanitizes generated text before it reaches the channel.
//!
//! Models running on a chat transcript like to keep going: they open a new
//! turn for the bot, write lines for other participants, or leak template
//! markers. The filter drops that material while keeping everything that
//! came before it, and it is safe to call repeatedly on growing text.

use regex::Regex;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Characters that separate lines. Separators are preserved verbatim.
const LINE_SEPARATORS: &[char] = &['\r', '\n', '\t', '\x0c', '\x0b'];

/// Compiled speaker-turn matchers derived from the prompt templates.
///
/// Both patterns must be anchored at the start and capture the prefix in
/// group 1 and the remaining text in group 2.
#[derive(Debug, Clone)]
pub struct TurnMatchers {
    /// The bot opening a fresh turn for itself.
    pub bot_turn: Regex,
    /// Any participant's turn opener.
    pub foreign_turn: Regex,
}

pub struct ImmersionBreakingFilter {
    enabled: bool,
    matchers: TurnMatchers,
    stop_markers: Vec<String>,
}

impl ImmersionBreakingFilter {
    pub fn new(enabled: bool, matchers: TurnMatchers, stop_markers: Vec<String>) -> Self {
        Self {
            enabled,
            matchers,
            stop_markers: stop_markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the text that may be sent and whether generation should stop.
    pub fn filter(&self, text: &str) -> (String, bool) {
        self.run(text, true)
    }

    /// Same as [`filter`](Self::filter) without logging, for probing text
    /// that is not going to be sent as-is.
    pub fn check(&self, text: &str) -> (String, bool) {
        self.run(text, false)
    }

    /// Splits on runs of line separators, keeping the separators as their own
    /// items so that concatenating the result gives back the input.
    pub fn split_lines(text: &str) -> Vec<&str> {
        let mut parts = Vec::new();
        let mut start = 0;
        let mut in_separator = false;
        for (index, ch) in text.char_indices() {
            let is_separator = LINE_SEPARATORS.contains(&ch);
            if index > start && is_separator != in_separator {
                parts.push(&text[start..index]);
                start = index;
            }
            in_separator = is_separator;
        }
        if start < text.len() {
            parts.push(&text[start..]);
        }
        parts
    }

    pub fn is_separator_only(line: &str) -> bool {
        line.chars().all(|c| LINE_SEPARATORS.contains(&c))
    }

    /// Splits one line into sentences. Every sentence ends in exactly one
    /// space except the last, which has trailing spaces removed.
    pub fn segment(line: &str) -> Vec<String> {
        let mut sentences: Vec<String> = line
            .split_sentence_bounds()
            .map(|s| format!("{} ", s.trim_end_matches(' ')))
            .collect();
        if let Some(last) = sentences.last_mut() {
            let trimmed = last.trim_end_matches(' ').len();
            last.truncate(trimmed);
        }
        sentences
    }

    fn run(&self, text: &str, log: bool) -> (String, bool) {
        if !self.enabled {
            return (text.to_string(), false);
        }

        let mut good_lines = String::with_capacity(text.len());
        let mut abort = false;

        for line in Self::split_lines(text) {
            if Self::is_separator_only(line) {
                good_lines.push_str(line);
                continue;
            }

            let body = line.trim_start();
            let leading_whitespace = &line[..line.len() - body.len()];

            let mut good_sentences = String::new();
            for sentence in Self::segment(body) {
                let mut sentence = sentence.as_str();

                if let Some(caps) = self.matchers.bot_turn.captures(sentence) {
                    if let (Some(prefix), Some(rest)) = (caps.get(1), caps.get(2)) {
                        if log {
                            warn!(
                                "Caught '{}' in response, trimming '{}' and continuing",
                                sentence,
                                prefix.as_str()
                            );
                        }
                        sentence = &sentence[rest.start()..];
                    }
                }

                if self.matchers.foreign_turn.is_match(sentence) {
                    if log {
                        warn!("Filtered out '{}' from response, aborting", sentence);
                    }
                    abort = true;
                    break;
                }

                if let Some((keep, removed)) = self.split_at_stop_marker(sentence) {
                    if log {
                        warn!(
                            "Caught '{}' in response, trimming '{}' and aborting",
                            sentence, removed
                        );
                    }
                    if !keep.trim().is_empty() {
                        good_sentences.push_str(keep);
                    }
                    abort = true;
                    break;
                }

                if !sentence.trim().is_empty() {
                    good_sentences.push_str(sentence);
                }
            }

            if !good_sentences.is_empty() || (!abort && !leading_whitespace.is_empty()) {
                good_lines.push_str(leading_whitespace);
                good_lines.push_str(&good_sentences);
            }
            if abort {
                break;
            }
        }

        (good_lines, abort)
    }

    /// Earliest stop marker in `sentence`, as (text before, text from marker).
    fn split_at_stop_marker<'a>(&self, sentence: &'a str) -> Option<(&'a str, &'a str)> {
        self.stop_markers
            .iter()
            .filter_map(|marker| sentence.find(marker.as_str()))
            .min()
            .map(|index| sentence.split_at(index))
    }
}
