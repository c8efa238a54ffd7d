use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oobabot_gateway::discord::{DiscordSink, start_discord_bot};
use oobabot_gateway::providers::{
    ImageDescriber, ImageGenerator, OobaClient, StableDiffusionClient, VisionClient,
};
use oobabot_gateway::state::{AppState, Backends};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    oobabot_core::load_dotenv();

    // Load configuration (validated up front)
    let config = oobabot_core::Config::load()?;
    let settings = config.settings;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| settings.logging.level.as_str().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Configuration loaded (persona: {}, backend: {})",
        settings.persona.ai_name, settings.oobabooga.base_url
    );

    // Create backend clients
    let text = Arc::new(OobaClient::new(
        &settings.oobabooga,
        config.secrets.api_key.clone(),
    )?);
    let images = StableDiffusionClient::from_settings(&settings.stable_diffusion)?
        .map(|client| Arc::new(client) as Arc<dyn ImageGenerator>);
    let vision = VisionClient::from_settings(&settings.vision, config.secrets.vision_api_key.clone())?
        .map(|client| Arc::new(client) as Arc<dyn ImageDescriber>);

    let token = config.secrets.discord_token;
    let http = Arc::new(serenity::http::Http::new(&token));
    let sink = Arc::new(DiscordSink::new(
        Arc::clone(&http),
        settings.discord.ignore_reactions.clone(),
    ));

    // Create shared application state
    let state = Arc::new(AppState::new(
        settings,
        Backends {
            text,
            images,
            vision,
        },
        sink.clone(),
    )?);

    let mut client = start_discord_bot(&token, Arc::clone(&state), sink).await?;
    let shard_manager = Arc::clone(&client.shard_manager);

    tokio::select! {
        result = client.start() => {
            if let Err(e) = result {
                error!("Discord client error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            shard_manager.shutdown_all().await;
        }
    }

    state.stats.write_summary();
    Ok(())
}
