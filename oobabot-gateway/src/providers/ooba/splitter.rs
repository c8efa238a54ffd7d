//! Turning a token stream into postable messages.

use std::time::{Duration, Instant};

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

const ASSISTANT_ECHO: &str = "### Assistant: ";

/// Accumulates tokens and hands back complete messages as soon as they are
/// recognisable.
pub trait MessageSplitter: Send {
    /// Feed the next token; returns any messages completed by it.
    fn push(&mut self, token: &str) -> Vec<String>;

    /// End of input: whatever is left, if it is more than whitespace.
    fn finish(&mut self) -> Option<String>;
}

/// Splits on sentence boundaries. The trailing, possibly incomplete,
/// sentence is held back until more text arrives or input ends.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    full_response: String,
    printed: usize,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageSplitter for SentenceSplitter {
    fn push(&mut self, token: &str) -> Vec<String> {
        self.full_response.push_str(token);
        let unseen = &self.full_response[self.printed..];
        let segments: Vec<(usize, &str)> = unseen.split_sentence_bound_indices().collect();

        let Some(&(last_start, _)) = segments.last() else {
            return Vec::new();
        };
        let complete = segments[..segments.len() - 1]
            .iter()
            .map(|(_, sentence)| sentence.to_string())
            .collect();
        self.printed += last_start;
        complete
    }

    fn finish(&mut self) -> Option<String> {
        let unseen = self.full_response[self.printed..].to_string();
        self.printed = self.full_response.len();
        (!unseen.trim().is_empty()).then_some(unseen)
    }
}

/// Splits with a user-supplied regex; the first capture group of each match
/// at the start of the unseen text is one message.
#[derive(Debug)]
pub struct RegexSplitter {
    pattern: Regex,
    full_response: String,
    printed: usize,
}

impl RegexSplitter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{pattern})"))?,
            full_response: String::new(),
            printed: 0,
        })
    }
}

impl MessageSplitter for RegexSplitter {
    fn push(&mut self, token: &str) -> Vec<String> {
        self.full_response.push_str(token);
        let mut messages = Vec::new();
        loop {
            let unseen = &self.full_response[self.printed..];
            let Some(caps) = self.pattern.captures(unseen) else {
                break;
            };
            let Some(whole) = caps.get(0) else {
                break;
            };
            if whole.end() == 0 {
                break;
            }
            if let Some(message) = caps.get(1) {
                messages.push(message.as_str().to_string());
            }
            self.printed += whole.end();
        }
        messages
    }

    fn finish(&mut self) -> Option<String> {
        let unseen = self.full_response[self.printed..].to_string();
        self.printed = self.full_response.len();
        (!unseen.trim().is_empty()).then_some(unseen)
    }
}

/// Some instruction-tuned models echo their turn header back.
pub fn strip_assistant_echo(message: &str) -> &str {
    message.strip_prefix(ASSISTANT_ECHO).unwrap_or(message)
}

/// Batches tokens so that a streamed message is not edited more often than
/// the platform tolerates.
#[derive(Debug)]
pub struct TokenGrouper {
    interval: Duration,
    last_emit: Instant,
    pending: String,
}

impl TokenGrouper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Instant::now(),
            pending: String::new(),
        }
    }

    /// Returns the batch once `interval` has passed since the last one.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.pending.push_str(token);
        let now = Instant::now();
        if now < self.last_emit + self.interval {
            return None;
        }
        self.last_emit = now;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn flush(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}
