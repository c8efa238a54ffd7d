//! Default prompt builder.
//!
//! Renders the persona and channel history into a completion prompt using
//! the `[templates]` settings, and derives from the same templates the
//! speaker-turn matchers used by the immersion filter and the stop
//! sequences used to keep the model from speaking for other users.

use std::collections::BTreeSet;

use oobabot_core::config::TemplateSettings;
use oobabot_core::{HistoryMessage, ImpersonationGuard, Settings, UserId};
use regex::Regex;
use tracing::debug;

use crate::filter::TurnMatchers;

const NAME: &str = "{name}";
const MESSAGE: &str = "{message}";
const DATETIME_FORMAT: &str = "%B %d, %Y - %I:%M:%S %p";
/// Longest display name the foreign-turn matcher recognises.
const MAX_SPEAKER_NAME: usize = 32;

/// Text placed after the history, just before the bot's turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptNote<'a> {
    #[default]
    None,
    /// An image for the message is on its way.
    ImageComing,
    /// The bot is asked to redo `response` according to `instruction`.
    Rewrite {
        response: &'a str,
        instruction: &'a str,
    },
}

/// A rendered prompt plus the users who appear in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    /// Distinct names of non-bot authors whose lines made it into the prompt.
    pub author_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    ai_name: String,
    persona: String,
    templates: TemplateSettings,
    char_budget: usize,
}

impl PromptBuilder {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ai_name: settings.persona.ai_name.clone(),
            persona: settings.persona.persona.clone(),
            templates: settings.templates.clone(),
            char_budget: settings.prompt_char_budget(),
        }
    }

    pub fn ai_name(&self) -> &str {
        &self.ai_name
    }

    fn render_block(template: &str, name: &str, message: &str) -> String {
        template.replace(NAME, name).replace(MESSAGE, message)
    }

    /// What the prompt ends with: the bot's own turn, left open.
    pub fn bot_turn_prefix(&self) -> String {
        Self::render_block(&self.templates.bot_history_block, &self.ai_name, "")
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }

    fn image_coming_text(&self) -> String {
        self.templates.image_coming.replace("{ai_name}", &self.ai_name)
    }

    fn rewrite_text(&self, response: &str, instruction: &str) -> String {
        self.templates
            .rewrite_request
            .replace("{ai_name}", &self.ai_name)
            .replace("{response}", response)
            .replace("{instruction}", instruction)
    }

    fn render_line(&self, message: &HistoryMessage, bot_user_id: UserId) -> String {
        if message.author_id == bot_user_id {
            Self::render_block(
                &self.templates.bot_history_block,
                &self.ai_name,
                &message.body_text,
            )
        } else {
            Self::render_block(
                &self.templates.user_history_block,
                &message.author_name,
                &message.body_text,
            )
        }
    }

    fn render(&self, history: &str, note: PromptNote<'_>) -> String {
        let image_text = if note == PromptNote::ImageComing {
            self.image_coming_text()
        } else {
            String::new()
        };
        let template = &self.templates.prompt;
        let mut history = history.to_string();
        if !template.contains("{image_coming}") {
            history.push_str(&image_text);
        }
        if let PromptNote::Rewrite {
            response,
            instruction,
        } = note
        {
            history.push_str(&self.rewrite_text(response, instruction));
        }
        let datetime = chrono::Local::now().format(DATETIME_FORMAT).to_string();

        let mut prompt = template
            .replace("{persona}", &self.persona)
            .replace("{ai_name}", &self.ai_name)
            .replace("{datetime}", &datetime)
            .replace("{image_coming}", &image_text)
            .replace("{history}", &history);
        prompt.push_str(&self.bot_turn_prefix());
        prompt
    }

    /// Builds the prompt from `history`, newest message first.
    ///
    /// Lines are taken newest-first until the character budget runs out, so
    /// the oldest history is what gets dropped.
    pub fn build(&self, history: &[HistoryMessage], bot_user_id: UserId, note: PromptNote<'_>) -> Prompt {
        let mut used = self.render("", note).chars().count();
        let mut lines = Vec::with_capacity(history.len());
        let mut names = BTreeSet::new();

        for message in history {
            if message.body_text.trim().is_empty() {
                continue;
            }
            let line = self.render_line(message, bot_user_id);
            let line_len = line.chars().count();
            if used + line_len > self.char_budget {
                debug!(
                    used,
                    budget = self.char_budget,
                    "Prompt budget reached, dropping older history"
                );
                break;
            }
            used += line_len;
            if message.author_id != bot_user_id {
                names.insert(message.author_name.clone());
            }
            lines.push(line);
        }

        lines.reverse();
        debug!(lines = lines.len(), chars = used, "Rendered prompt history");
        Prompt {
            text: self.render(&lines.concat(), note),
            author_names: names.into_iter().collect(),
        }
    }

    /// Speaker-turn matchers for the immersion filter.
    pub fn turn_matchers(&self) -> Result<TurnMatchers, regex::Error> {
        let bot_turn = Regex::new(&format!(
            r"^({})(.*)$",
            regex::escape(&self.bot_turn_prefix())
        ))?;

        let user_prefix = Self::render_block(&self.templates.user_history_block, NAME, "");
        let user_prefix = user_prefix.trim_matches(['\n', '\r']);
        let foreign_turn = match user_prefix.split_once(NAME) {
            Some((before, after)) if !before.trim().is_empty() || !after.trim().is_empty() => {
                Regex::new(&format!(
                    r"^({}[\S ]{{1,{MAX_SPEAKER_NAME}}}{})(.*)$",
                    regex::escape(before),
                    regex::escape(after)
                ))?
            }
            // Without a literal around the name there is nothing to recognise.
            _ => Regex::new(r"^()\b\B(.*)$")?,
        };

        Ok(TurnMatchers {
            bot_turn,
            foreign_turn,
        })
    }

    /// Stop sequences that keep the model from writing other users' turns.
    pub fn impersonation_stops(&self, guard: ImpersonationGuard, author_names: &[String]) -> Vec<String> {
        let mut stops = Vec::new();
        for name in author_names {
            if guard.uses_prefix() {
                let prefix = Self::render_block(&self.templates.user_history_block, name, "");
                let prefix = prefix.trim();
                if !prefix.is_empty() {
                    stops.push(prefix.to_string());
                }
            }
            if guard.uses_first_name() {
                let canonical = canonical_name(name);
                if !canonical.is_empty() {
                    stops.push(format!("\n{canonical}"));
                }
            }
        }
        stops
    }
}

/// First word of a display name, capitalised. Falls back to the whole
/// name when the first word is shorter than three characters.
pub fn canonical_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || c.is_ascii_punctuation())
        .collect();
    let cleaned = cleaned.trim();
    let Some(first) = cleaned.split_whitespace().next() else {
        return String::new();
    };

    let mut chars = first.chars();
    let capitalized: String = match chars.next() {
        Some(head) => head.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    if capitalized.chars().count() >= 3 {
        capitalized
    } else {
        cleaned.to_string()
    }
}
