pub mod ooba;
pub mod provider;
pub mod stable_diffusion;
pub mod vision;

pub use ooba::OobaClient;
pub use provider::{
    ImageDescriber, ImageGenerator, ProviderError, TextGenerator, TokenStream, collect_stream,
};
pub use stable_diffusion::StableDiffusionClient;
pub use vision::VisionClient;
