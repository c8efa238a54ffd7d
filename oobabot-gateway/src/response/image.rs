//! Spotting image requests in chat messages.

use oobabot_core::config::StableDiffusionSettings;
use regex::Regex;
use tracing::debug;

const MIN_IMAGE_PROMPT_LENGTH: usize = 3;

pub struct ImagePromptDetector {
    image_patterns: Vec<Regex>,
    avatar_patterns: Vec<Regex>,
    avatar_prompt: String,
}

impl ImagePromptDetector {
    pub fn new(settings: &StableDiffusionSettings) -> Result<Self, regex::Error> {
        let image_patterns = settings
            .image_words
            .iter()
            .filter(|word| !word.trim().is_empty())
            .map(|word| {
                Regex::new(&format!(
                    r#"(?im)^.*\b{}\b\s*((as?|of|the|with)\b\s*)*:?([\w\s,;:<>`~@#%&=$^*()\-+\[\]{{}}"']+).*$"#,
                    regex::escape(word.trim())
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let avatar_patterns = settings
            .avatar_words
            .iter()
            .filter(|word| !word.trim().is_empty())
            .map(|word| Regex::new(&format!(r"(?im)\b{}[^\w]*\b", regex::escape(word.trim()))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            image_patterns,
            avatar_patterns,
            avatar_prompt: settings.avatar_prompt.trim().to_string(),
        })
    }

    /// The image description asked for in `text`, if any, with self-portrait
    /// requests rewritten to the configured avatar prompt.
    pub fn detect(&self, text: &str) -> Option<String> {
        let prompt = self.image_patterns.iter().find_map(|pattern| {
            let caps = pattern.captures(text)?;
            let prompt = caps.get(3)?.as_str();
            (prompt.chars().count() >= MIN_IMAGE_PROMPT_LENGTH).then(|| prompt.to_string())
        })?;
        debug!(prompt = %prompt, "Found image prompt");
        Some(self.substitute_avatar(&prompt).unwrap_or(prompt))
    }

    fn substitute_avatar(&self, prompt: &str) -> Option<String> {
        if self.avatar_prompt.is_empty() {
            return None;
        }
        let pattern = self.avatar_patterns.iter().find(|p| p.is_match(prompt))?;
        let replacement = format!("{}, ", self.avatar_prompt);
        let substituted = pattern.replace_all(prompt, regex::NoExpand(&replacement));
        debug!("Self-portrait requested, substituting avatar prompt");
        Some(substituted.trim_matches([',', ' ']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(avatar_prompt: &str) -> ImagePromptDetector {
        let settings = StableDiffusionSettings {
            avatar_prompt: avatar_prompt.to_string(),
            ..Default::default()
        };
        ImagePromptDetector::new(&settings).unwrap()
    }

    #[test]
    fn finds_prompt_after_image_word() {
        let detector = detector("");
        assert_eq!(
            detector.detect("hey oobabot, draw a cat").as_deref(),
            Some("cat")
        );
        assert_eq!(
            detector.detect("Could you sketch of the old lighthouse").as_deref(),
            Some("old lighthouse")
        );
    }

    #[test]
    fn ignores_short_or_missing_prompts() {
        let detector = detector("");
        assert_eq!(detector.detect("draw"), None);
        assert_eq!(detector.detect("nothing to see here"), None);
        assert_eq!(detector.detect("withdrawal symptoms"), None);
    }

    #[test]
    fn avatar_words_use_avatar_prompt() {
        let detector = detector("a red robot");
        assert_eq!(
            detector.detect("draw yourself on a beach").as_deref(),
            Some("a red robot, on a beach")
        );
        let plain = self::detector("");
        assert_eq!(
            plain.detect("draw yourself on a beach").as_deref(),
            Some("yourself on a beach")
        );
    }
}
