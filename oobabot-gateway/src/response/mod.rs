//! Turning a decision to respond into messages in a channel.

pub mod history;
pub mod image;
pub mod pipeline;
pub mod sink;
pub mod stats;

pub use history::HistoryReader;
pub use image::ImagePromptDetector;
pub use pipeline::{PipelineError, PipelineSettings, RenderMode, ResponsePipeline, split_for_limit};
pub use sink::{ChannelSink, SentMessage, SinkError, TypingGuard, send_with_fallback};
pub use stats::{ResponseStats, ResponseTimer, StatsSnapshot};
