pub mod config;
pub mod message;

// Config re-exports
pub use config::{
    Config, ConfigError, ImpersonationGuard, Secrets, SecretsError, Settings, SettingsError,
    StreamMode, load_dotenv,
};

// Message re-exports
pub use message::{ChannelId, ChatMessage, GuildId, HistoryMessage, MessageId, UserId};
