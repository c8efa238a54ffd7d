//! HTTP client for the text-generation server.
//!
//! Speaks the OpenAI-compatible completions API that Oobabooga exposes,
//! plus its internal stop and tokenizer endpoints.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use oobabot_core::config::OobaboogaSettings;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::providers::provider::{ProviderError, TextGenerator, TokenStream};

const STOP_GENERATION_PATH: &str = "/v1/internal/stop-generation";
const TOKENIZER_PATH: &str = "/v1/internal/encode";
/// The hosted OpenAI API rejects more stop sequences than this.
const OPENAI_MAX_STOP_SEQUENCES: usize = 4;

/// Streaming completions client.
///
/// The server cannot run two generations at once, so requests are
/// serialized: a stream holds the only permit until it finishes or its
/// receiver is dropped, and other callers wait for it.
#[derive(Clone)]
pub struct OobaClient {
    http_client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    use_chat_completions: bool,
    request_params: Map<String, Value>,
    log_all_the_things: bool,
    permit: Arc<Semaphore>,
}

/// Tokens extracted from one line of the event stream.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedLine {
    pub tokens: Vec<String>,
    /// The backend reported the generation as finished.
    pub finished: bool,
}

impl OobaClient {
    pub fn new(settings: &OobaboogaSettings, api_key: Option<String>) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(1)
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()?;

        Ok(Self {
            http_client,
            api_key,
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            use_chat_completions: settings.use_chat_completions,
            request_params: settings.request_params.clone(),
            log_all_the_things: settings.log_all_the_things,
            permit: Arc::new(Semaphore::new(1)),
        })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let auth_value = format!("Bearer {}", api_key);
            if let Ok(header_value) = HeaderValue::from_str(&auth_value) {
                headers.insert(AUTHORIZATION, header_value);
            }
        }
        headers
    }

    /// Base URL without a trailing slash or `/v1` suffix.
    fn api_root(&self) -> &str {
        let base = self.base_url.trim_end_matches('/');
        base.strip_suffix("/v1").unwrap_or(base)
    }

    fn completions_url(&self) -> String {
        if self.use_chat_completions {
            format!("{}/v1/chat/completions", self.api_root())
        } else {
            format!("{}/v1/completions", self.api_root())
        }
    }

    fn is_hosted_openai(&self) -> bool {
        self.base_url.contains("api.openai.com")
    }

    /// Request body: configured parameters, then the prompt, with runtime
    /// stop sequences appended to the configured ones.
    pub fn build_request_body(&self, prompt: &str, stop_sequences: &[String]) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert("stream".into(), Value::Bool(true));
        if self.use_chat_completions {
            body.insert(
                "messages".into(),
                json!([{ "role": "user", "content": prompt }]),
            );
        } else {
            body.insert("prompt".into(), Value::String(prompt.to_string()));
        }
        for (key, value) in &self.request_params {
            body.insert(key.clone(), value.clone());
        }

        let mut stop: Vec<Value> = self
            .request_params
            .get("stop")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for sequence in stop_sequences {
            let sequence = Value::String(sequence.clone());
            if !stop.contains(&sequence) {
                stop.push(sequence);
            }
        }
        if self.is_hosted_openai() && stop.len() > OPENAI_MAX_STOP_SEQUENCES {
            debug!("Truncating stop sequences to the hosted API limit");
            stop.truncate(OPENAI_MAX_STOP_SEQUENCES);
        }
        body.insert("stop".into(), Value::Array(stop));
        Value::Object(body)
    }

    fn api_error(status: reqwest::StatusCode, body: String) -> ProviderError {
        ProviderError::ApiError {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Parses one server-sent-events line. Undecodable frames yield nothing.
///
/// Understands the OpenAI shape (`choices[].text` or `choices[].delta.content`
/// with `finish_reason`) and the older `{text, is_finished}` shape.
pub fn parse_stream_line(line: &str) -> ParsedLine {
    let line = line.trim();
    let data = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if data.is_empty() {
        return ParsedLine::default();
    }
    if data == "[DONE]" {
        return ParsedLine {
            tokens: Vec::new(),
            finished: true,
        };
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return ParsedLine::default();
    };

    let mut parsed = ParsedLine::default();
    if let Some(choices) = event.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let text = choice
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| choice.pointer("/delta/content").and_then(Value::as_str))
                .unwrap_or_default();
            if !text.is_empty() {
                parsed.tokens.push(text.to_string());
            }
            if choice.get("finish_reason").is_some_and(|r| !r.is_null()) {
                parsed.finished = true;
                break;
            }
        }
    } else {
        if let Some(text) = event.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                parsed.tokens.push(text.to_string());
            }
        }
        parsed.finished = event
            .get("is_finished")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    }
    parsed
}

#[async_trait::async_trait]
impl TextGenerator for OobaClient {
    fn name(&self) -> &str {
        "oobabooga"
    }

    async fn stream(
        &self,
        prompt: &str,
        stop_sequences: &[String],
    ) -> Result<TokenStream, ProviderError> {
        let permit = Arc::clone(&self.permit)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::InvalidFormat("client is shutting down".to_string()))?;

        let body = self.build_request_body(prompt, stop_sequences);
        if self.log_all_the_things {
            debug!(request = %body, "Sending completion request");
        }

        let response = self
            .http_client
            .post(self.completions_url())
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, text));
        }

        let log_tokens = self.log_all_the_things;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let _permit = permit;
            let mut stream = response.bytes_stream();
            let mut line_buf = String::new();

            loop {
                let chunk = tokio::select! {
                    _ = tx.closed() => return,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::HttpError(e))).await;
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=pos).collect();
                    let parsed = parse_stream_line(&line);
                    for token in parsed.tokens {
                        if log_tokens {
                            debug!(token = %token, "Received token");
                        }
                        if tx.send(Ok(token)).await.is_err() {
                            return;
                        }
                    }
                    if parsed.finished {
                        return;
                    }
                }
            }

            for token in parse_stream_line(&line_buf).tokens {
                let _ = tx.send(Ok(token)).await;
            }
        });

        Ok(rx)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        let url = format!("{}{}", self.api_root(), STOP_GENERATION_PATH);
        let response = self
            .http_client
            .post(url)
            .headers(self.build_headers())
            .json(&json!({}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Backend refused to stop generation");
            return Err(Self::api_error(status, text));
        }
        Ok(())
    }

    fn can_abort(&self) -> bool {
        !self.is_hosted_openai()
    }

    async fn token_count(&self, text: &str) -> Result<usize, ProviderError> {
        let url = format!("{}{}", self.api_root(), TOKENIZER_PATH);
        let response = self
            .http_client
            .post(url)
            .headers(self.build_headers())
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, text));
        }
        let body: Value = response.json().await?;
        body.get("length")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| ProviderError::InvalidFormat("tokenizer response has no length".into()))
    }
}
