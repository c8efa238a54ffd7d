//! Backend traits shared by the text, image and vision clients.

use tokio::sync::mpsc;

/// Incremental text from a generation backend. The channel closing is the
/// end-of-stream marker.
pub type TokenStream = mpsc::Receiver<Result<String, ProviderError>>;

/// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid response format: {0}")]
    InvalidFormat(String),
    #[error("Not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// A streaming text-generation backend.
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Start generating. Chunks arrive on the returned stream as soon as
    /// the backend produces them.
    async fn stream(&self, prompt: &str, stop_sequences: &[String])
    -> Result<TokenStream, ProviderError>;

    /// Ask the backend to stop whatever it is generating right now.
    async fn stop(&self) -> Result<(), ProviderError>;

    /// Whether [`stop`](Self::stop) does anything server-side.
    fn can_abort(&self) -> bool {
        false
    }

    /// Number of tokens `text` encodes to.
    async fn token_count(&self, _text: &str) -> Result<usize, ProviderError> {
        Err(ProviderError::Unsupported("token count"))
    }
}

/// Turns a text prompt into an image.
#[async_trait::async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns PNG bytes.
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Describes an image in words so the text model can "see" it.
#[async_trait::async_trait]
pub trait ImageDescriber: Send + Sync {
    /// `None` when the backend had nothing to say.
    async fn describe(&self, image_url: &str) -> Result<Option<String>, ProviderError>;
}

/// Collects a whole stream into one string.
pub async fn collect_stream(mut stream: TokenStream) -> Result<String, ProviderError> {
    let mut text = String::new();
    while let Some(chunk) = stream.recv().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_stream_concatenates_until_close() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("Hel".to_string())).await.unwrap();
        tx.send(Ok("lo".to_string())).await.unwrap();
        drop(tx);
        assert_eq!(collect_stream(rx).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn collect_stream_surfaces_errors() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("partial".to_string())).await.unwrap();
        tx.send(Err(ProviderError::InvalidFormat("bad frame".into())))
            .await
            .unwrap();
        drop(tx);
        assert!(matches!(
            collect_stream(rx).await,
            Err(ProviderError::InvalidFormat(_))
        ));
    }
}
