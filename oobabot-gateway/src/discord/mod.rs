mod bot;
mod commands;
pub mod convert;
pub mod presence;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use serenity::prelude::*;
use tracing::info;

pub use bot::Bot;
pub use commands::parse_message_reference;
pub use presence::PresenceManager;
pub use sink::DiscordSink;

/// Build the Discord client. The sink must use the same bot token.
pub async fn start_discord_bot(
    token: &str,
    state: Arc<crate::state::AppState>,
    sink: Arc<DiscordSink>,
) -> Result<Client, DiscordError> {
    info!("Starting Discord bot...");

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::DIRECT_MESSAGE_REACTIONS;

    let presence = Arc::new(PresenceManager::new(Duration::from_secs_f64(
        state.settings.discord.idle_timeout,
    )));
    tokio::spawn(Arc::clone(&presence).run(state.queue.subscribe_busy()));

    let bot = Bot::new(state, sink, presence);

    Client::builder(token, intents)
        .event_handler(bot)
        .await
        .map_err(|e| DiscordError::ClientError(e.to_string()))
}

/// Discord-related errors
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("Failed to create Discord client: {0}")]
    ClientError(String),
}
