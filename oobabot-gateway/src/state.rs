//! Shared application state: one decision engine, one queue, one pipeline.

use std::sync::Arc;

use oobabot_core::{Settings, SettingsError};
use tracing::info;

use crate::decide::{RandomSource, ResponseDecisionEngine, ThreadRandom};
use crate::providers::{ImageDescriber, ImageGenerator, TextGenerator};
use crate::queue::{MessageQueue, QueueSettings, ResponseHandler};
use crate::repetition::RepetitionTracker;
use crate::response::{ChannelSink, PipelineError, ResponsePipeline, ResponseStats};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Backends the pipeline talks to. Image and vision are optional.
pub struct Backends {
    pub text: Arc<dyn TextGenerator>,
    pub images: Option<Arc<dyn ImageGenerator>>,
    pub vision: Option<Arc<dyn ImageDescriber>>,
}

pub struct AppState {
    pub settings: Settings,
    pub engine: Arc<ResponseDecisionEngine>,
    pub repetition: Arc<RepetitionTracker>,
    pub stats: Arc<ResponseStats>,
    pub pipeline: Arc<ResponsePipeline>,
    pub queue: Arc<MessageQueue>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        backends: Backends,
        sink: Arc<dyn ChannelSink>,
    ) -> Result<Self, StateError> {
        Self::with_random(settings, backends, sink, Arc::new(ThreadRandom))
    }

    /// Same as [`new`](Self::new) with a chosen source of randomness for
    /// unsolicited replies.
    pub fn with_random(
        settings: Settings,
        backends: Backends,
        sink: Arc<dyn ChannelSink>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, StateError> {
        let engine = Arc::new(ResponseDecisionEngine::new(&settings, random)?);
        let repetition = Arc::new(RepetitionTracker::new(
            settings.discord.repetition_threshold,
            settings.discord.repetition_similarity_threshold,
        ));
        let stats = Arc::new(ResponseStats::new());

        let mut pipeline = ResponsePipeline::new(
            &settings,
            Arc::clone(&engine),
            backends.text,
            sink,
            Arc::clone(&repetition),
            Arc::clone(&stats),
        )?;
        if let Some(images) = backends.images {
            info!("Image generation enabled");
            pipeline = pipeline.with_images(&settings, images)?;
        }
        if let Some(vision) = backends.vision {
            info!("Image descriptions enabled");
            pipeline = pipeline.with_vision(vision);
        }
        let pipeline = Arc::new(pipeline);
        let handler: Arc<dyn ResponseHandler> = pipeline.clone();

        let queue = Arc::new(MessageQueue::new(
            QueueSettings::from(&settings.discord),
            Arc::clone(&engine),
            handler,
        ));

        Ok(Self {
            settings,
            engine,
            repetition,
            stats,
            pipeline,
            queue,
        })
    }
}
