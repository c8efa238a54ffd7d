//! Image description through an OpenAI-compatible vision endpoint.

use std::time::Duration;

use oobabot_core::config::VisionSettings;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};

use crate::providers::provider::{ImageDescriber, ProviderError};

const DESCRIBE_INSTRUCTION: &str = "Describe the following image in as much detail as possible, including any relevant details while being concise.";
const VISION_TIMEOUT: Duration = Duration::from_secs(120);

pub struct VisionClient {
    http_client: reqwest::Client,
    /// Full endpoint URL, not a base.
    url: String,
    api_key: Option<String>,
    model: String,
    request_params: Map<String, Value>,
}

impl VisionClient {
    /// Returns `None` when no URL is configured.
    pub fn from_settings(
        settings: &VisionSettings,
        api_key: Option<String>,
    ) -> Result<Option<Self>, ProviderError> {
        if settings.url.trim().is_empty() {
            return Ok(None);
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(VISION_TIMEOUT)
            .build()?;

        Ok(Some(Self {
            http_client,
            url: settings.url.trim().to_string(),
            api_key,
            model: settings.model.clone(),
            request_params: settings.request_params.clone(),
        }))
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", api_key)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    pub fn build_request_body(&self, image_url: &str) -> Value {
        let mut body = self.request_params.clone();
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert(
            "messages".into(),
            json!([{
                "role": "user",
                "content": [
                    { "type": "text", "text": DESCRIBE_INSTRUCTION },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]),
        );
        Value::Object(body)
    }
}

fn extract_description(body: &Value) -> Option<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(String::from)
}

#[async_trait::async_trait]
impl ImageDescriber for VisionClient {
    async fn describe(&self, image_url: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .http_client
            .post(&self.url)
            .headers(self.build_headers())
            .json(&self.build_request_body(image_url))
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
        let body: Value = response.json().await?;
        Ok(extract_description(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_url() {
        let settings = VisionSettings::default();
        assert!(VisionClient::from_settings(&settings, None).unwrap().is_none());
    }

    #[test]
    fn test_request_body_carries_image() {
        let settings = VisionSettings {
            url: "http://vision/v1/chat/completions".to_string(),
            ..Default::default()
        };
        let client = VisionClient::from_settings(&settings, Some("k".into()))
            .unwrap()
            .unwrap();
        let body = client.build_request_body("https://cdn/cat.png");
        assert_eq!(body["model"], "gpt-4-vision-preview");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "https://cdn/cat.png"
        );
        assert_eq!(client.build_headers().get(AUTHORIZATION).unwrap(), "Bearer k");
    }

    #[test]
    fn test_extract_description() {
        let body = json!({"choices": [{"message": {"content": " A cat. "}}]});
        assert_eq!(extract_description(&body), Some("A cat.".to_string()));
        assert_eq!(extract_description(&json!({"choices": []})), None);
        let blank = json!({"choices": [{"message": {"content": "  "}}]});
        assert_eq!(extract_description(&blank), None);
    }
}
