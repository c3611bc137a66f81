//! Anthropic Claude client.

use super::LlmProvider;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anthropic Claude LLM client.
///
/// The enrichment batch is sized for a small fast model; the default is the
/// cheapest Haiku tier.
pub struct AnthropicClient {
    /// API key.
    api_key: Option<String>,
    /// API endpoint.
    endpoint: String,
    /// Model to use.
    model: String,
    /// HTTP client.
    client: reqwest::blocking::Client,
    /// Request timeout in seconds (for error reporting).
    timeout_secs: u64,
}

impl AnthropicClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com/v1";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "claude-3-haiku-20240307";

    /// Default request timeout.
    const DEFAULT_TIMEOUT_SECS: u64 = 60;

    /// Creates a new Anthropic client from the environment.
    #[must_use]
    pub fn new() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        Self {
            api_key,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: std::env::var("LAMINARK_CLASSIFIER_MODEL")
                .unwrap_or_else(|_| Self::DEFAULT_MODEL.to_string()),
            client: build_client(Self::DEFAULT_TIMEOUT_SECS),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Returns true when an API key is configured.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn request(&self, system: &str, prompt: &str) -> Result<String> {
        let api_key = self.api_key.as_ref().ok_or_else(|| Error::AdapterUnavailable {
            adapter: "anthropic".to_string(),
            cause: "ANTHROPIC_API_KEY not set".to_string(),
        })?;

        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            system: system.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.endpoint))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    Error::AdapterTimeout {
                        adapter: "anthropic".to_string(),
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    Error::AdapterUnavailable {
                        adapter: "anthropic".to_string(),
                        cause: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::AdapterUnavailable {
                adapter: "anthropic".to_string(),
                cause: format!("HTTP {}", response.status()),
            });
        }

        let body: MessagesResponse = response.json().map_err(|e| Error::AdapterUnavailable {
            adapter: "anthropic".to_string(),
            cause: format!("malformed response body: {e}"),
        })?;

        body.content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .ok_or_else(|| Error::AdapterUnavailable {
                adapter: "anthropic".to_string(),
                cause: "response contained no text block".to_string(),
            })
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        self.request(system, prompt)
    }
}

fn build_client(timeout_secs: u64) -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}
