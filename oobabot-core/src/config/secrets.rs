//! Secrets configuration loaded from environment variables only.
//!
//! Tokens and API keys never live in the TOML file.

use std::env;

/// Secrets loaded exclusively from environment variables.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    /// Discord bot token (env: DISCORD_TOKEN)
    pub discord_token: String,

    /// Bearer token for the text-generation backend (env: OOBABOT_API_KEY)
    pub api_key: Option<String>,

    /// Bearer token for the vision backend (env: OOBABOT_VISION_API_KEY)
    pub vision_api_key: Option<String>,
}

/// Errors that can occur when loading secrets
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Missing required secret: {0}")]
    MissingSecret(String),
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Secrets {
    /// Load secrets from environment variables.
    ///
    /// This function also loads .env file if present (for development),
    /// but production should rely on actual environment variables.
    pub fn from_env() -> Result<Self, SecretsError> {
        let _ = dotenvy::dotenv();

        Self::from_env_inner()
    }

    /// Internal method to load from environment without loading .env
    pub(crate) fn from_env_inner() -> Result<Self, SecretsError> {
        let discord_token = non_empty_var("DISCORD_TOKEN")
            .ok_or_else(|| SecretsError::MissingSecret("DISCORD_TOKEN".to_string()))?;

        Ok(Self {
            discord_token,
            api_key: non_empty_var("OOBABOT_API_KEY"),
            vision_api_key: non_empty_var("OOBABOT_VISION_API_KEY"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;

    fn clear_env() {
        unsafe {
            env::remove_var("DISCORD_TOKEN");
            env::remove_var("OOBABOT_API_KEY");
            env::remove_var("OOBABOT_VISION_API_KEY");
        }
    }

    #[test]
    fn test_missing_discord_token() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let result = Secrets::from_env_inner();
        assert!(matches!(
            result,
            Err(SecretsError::MissingSecret(name)) if name == "DISCORD_TOKEN"
        ));
    }

    #[test]
    fn test_blank_token_counts_as_missing() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        unsafe { env::set_var("DISCORD_TOKEN", "   ") };

        assert!(Secrets::from_env_inner().is_err());
        clear_env();
    }

    #[test]
    fn test_optional_keys() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        unsafe {
            env::set_var("DISCORD_TOKEN", "token-123");
            env::set_var("OOBABOT_API_KEY", "sk-local");
        }

        let secrets = Secrets::from_env_inner().unwrap();
        assert_eq!(secrets.discord_token, "token-123");
        assert_eq!(secrets.api_key.as_deref(), Some("sk-local"));
        assert!(secrets.vision_api_key.is_none());
        clear_env();
    }
}
