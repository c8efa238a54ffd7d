pub mod decide;
pub mod discord;
pub mod filter;
pub mod prompt;
pub mod providers;
pub mod queue;
pub mod repetition;
pub mod response;
pub mod state;

pub use decide::{Decision, ResponseDecisionEngine};
pub use filter::ImmersionBreakingFilter;
pub use providers::provider::{
    ImageDescriber, ImageGenerator, ProviderError, TextGenerator, TokenStream,
};
pub use queue::{MessageQueue, ResponseContext, ResponseHandler};
pub use repetition::RepetitionTracker;
pub use response::{ChannelSink, ResponsePipeline, ResponseStats, SinkError};
pub use state::{AppState, Backends, StateError};
