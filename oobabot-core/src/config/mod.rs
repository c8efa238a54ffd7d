//! Configuration management for oobabot.
//!
//! Secrets come from environment variables, everything else from a TOML file.
//!
//! # Configuration Sources
//!
//! ## Secrets (Environment Variables)
//! - `DISCORD_TOKEN` - Discord bot token (required)
//! - `OOBABOT_API_KEY` - bearer token for the text-generation backend
//! - `OOBABOT_VISION_API_KEY` - bearer token for the vision backend
//!
//! ## Settings (TOML File)
//! Located at `~/.config/oobabot/config.toml` (or `$OOBABOT_CONFIG_DIR/config.toml`):
//! ```toml
//! [persona]
//! ai_name = "Rosie"
//! wakewords = ["rosie"]
//!
//! [discord]
//! message_accumulation_period = 2.0
//! respond_to_latest_only = true
//! stream_responses = "sentence"
//!
//! [oobabooga]
//! base_url = "http://localhost:5000"
//!
//! [logging]
//! level = "info"
//! ```

mod secrets;
mod settings;

pub use secrets::{Secrets, SecretsError};
pub use settings::{
    ChanceTable, DiscordSettings, ImpersonationGuard, LoggingSettings, OobaboogaSettings,
    PersonaSettings, Settings, SettingsError, StableDiffusionSettings, StreamMode,
    TemplateSettings, VisionSettings, validate_chance_table,
};

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Combined configuration containing both secrets and settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secrets loaded from environment variables
    pub secrets: Secrets,
    /// Settings loaded from TOML configuration file
    pub settings: Settings,
}

/// Errors that can occur when loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Settings are validated here, so a bad calibration table or a negative
    /// retry count stops the process at startup rather than mid-conversation.
    pub fn load() -> Result<Self, ConfigError> {
        let secrets = Secrets::from_env()?;
        let settings = Settings::load()?;
        Ok(Self { secrets, settings })
    }

    /// Build a config from parts, running the same validation as `load`.
    pub fn from_parts(secrets: Secrets, settings: Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self { secrets, settings })
    }
}

/// Load .env file if present.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}
