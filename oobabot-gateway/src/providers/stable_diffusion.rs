//! Stable Diffusion (AUTOMATIC1111 web UI) image client.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oobabot_core::config::StableDiffusionSettings;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::providers::provider::{ImageGenerator, ProviderError};

const TXT2IMG_PATH: &str = "/sdapi/v1/txt2img";

pub struct StableDiffusionClient {
    http_client: reqwest::Client,
    base_url: String,
    extra_prompt_text: String,
    request_params: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

impl StableDiffusionClient {
    /// Returns `None` when no URL is configured.
    pub fn from_settings(settings: &StableDiffusionSettings) -> Result<Option<Self>, ProviderError> {
        if settings.url.trim().is_empty() {
            return Ok(None);
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;

        Ok(Some(Self {
            http_client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            extra_prompt_text: settings.extra_prompt_text.clone(),
            request_params: settings.request_params.clone(),
        }))
    }

    pub fn build_request_body(&self, prompt: &str) -> Value {
        let mut full_prompt = prompt.to_string();
        if !self.extra_prompt_text.is_empty() {
            full_prompt.push_str(", ");
            full_prompt.push_str(&self.extra_prompt_text);
        }
        let mut body = self.request_params.clone();
        body.insert("prompt".into(), Value::String(full_prompt));
        Value::Object(body)
    }
}

#[async_trait::async_trait]
impl ImageGenerator for StableDiffusionClient {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ProviderError> {
        let body = self.build_request_body(prompt);
        debug!(prompt, "Requesting image");

        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, TXT2IMG_PATH))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: Txt2ImgResponse = response.json().await?;
        decode_first_image(&parsed.images)
    }
}

fn decode_first_image(images: &[String]) -> Result<Vec<u8>, ProviderError> {
    let encoded = images
        .first()
        .ok_or_else(|| ProviderError::InvalidFormat("no images in response".to_string()))?;
    // Some builds prefix a data URL header.
    let payload = encoded
        .split_once("base64,")
        .map_or(encoded.as_str(), |(_, data)| data);
    STANDARD
        .decode(payload)
        .map_err(|e| ProviderError::InvalidFormat(format!("image is not base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(url: &str) -> StableDiffusionSettings {
        StableDiffusionSettings {
            url: url.to_string(),
            extra_prompt_text: "high quality".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(StableDiffusionClient::from_settings(&settings("  ")).unwrap().is_none());
    }

    #[test]
    fn test_request_body_appends_extra_text() {
        let client = StableDiffusionClient::from_settings(&settings("http://sd:7860/"))
            .unwrap()
            .unwrap();
        assert_eq!(client.base_url, "http://sd:7860");

        let body = client.build_request_body("a cat");
        assert_eq!(body["prompt"], json!("a cat, high quality"));
        assert_eq!(body["steps"], json!(30));
    }

    #[test]
    fn test_decode_first_image() {
        let png = STANDARD.encode([0x89, b'P', b'N', b'G']);
        assert_eq!(
            decode_first_image(&[png.clone()]).unwrap(),
            vec![0x89, b'P', b'N', b'G']
        );
        let with_header = format!("data:image/png;base64,{png}");
        assert_eq!(decode_first_image(&[with_header]).unwrap().len(), 4);
        assert!(decode_first_image(&[]).is_err());
        assert!(decode_first_image(&["%%%".to_string()]).is_err());
    }
}
