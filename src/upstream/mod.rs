//! Streaming text generation against an OpenAI-compatible endpoint.
//!
//! [`RetryingUpstreamClient`] owns the retry policy: a whole generation is
//! re-attempted after a fixed delay, fragments already yielded are never
//! retracted, and exhausting every attempt yields exactly one error
//! fragment instead of failing. Transport errors therefore never reach the
//! pipeline as `Err`.

mod http;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::config::UpstreamSection;
use crate::errors::{PipelineError, UpstreamError};

pub use http::HttpChatTransport;

/// Client type accepted in a pipeline's `llm_client` object.
pub const CLIENT_TYPE: &str = "stream_openai_llm";

/// Fragments of one attempt, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String, UpstreamError>>;

/// How requests are addressed and authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EndpointMode {
    /// `POST {base_url}/chat/completions` with `Authorization: Bearer`.
    #[default]
    Standard,
    /// `POST {base_url}/openai/deployments/{deployment}/chat/completions`
    /// with an `api-key` header.
    Azure {
        deployment: String,
        api_version: String,
    },
}

/// The `llm_client` object of a pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmClientConfig {
    #[serde(rename = "type", default)]
    pub client_type: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub endpoint: EndpointMode,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub endpoint: EndpointMode,
    pub timeout: Duration,
    /// Total attempts per generation; values below 1 mean 1.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl UpstreamSettings {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        defaults: &UpstreamSection,
    ) -> Self {
        Self {
            api_key: None,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: defaults.temperature,
            system_prompt: defaults.system_prompt.clone(),
            endpoint: EndpointMode::Standard,
            timeout: Duration::from_secs(defaults.timeout_secs.max(1)),
            max_retries: defaults.max_retries,
            retry_delay: Duration::from_millis(defaults.retry_delay_ms),
        }
    }

    /// Build settings from a pipeline's `llm_client` value, filling gaps
    /// from the configured defaults.
    pub fn from_client_value(value: &Value, defaults: &UpstreamSection) -> Result<Self, PipelineError> {
        let client: LlmClientConfig = serde_json::from_value(value.clone())
            .map_err(|e| PipelineError::InvalidConfig(format!("llm_client: {}", e)))?;
        if let Some(kind) = client.client_type.as_deref()
            && kind != CLIENT_TYPE
        {
            return Err(PipelineError::InvalidConfig(format!(
                "llm_client type '{}' is not supported (expected '{}')",
                kind, CLIENT_TYPE
            )));
        }

        let mut settings = Self::new(client.base_url, client.model, defaults);
        settings.api_key = client.api_key.filter(|k| !k.trim().is_empty());
        settings.endpoint = client.endpoint;
        if let Some(temperature) = client.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_retries) = client.max_retries {
            settings.max_retries = max_retries;
        }
        if let Some(secs) = client.timeout_secs {
            settings.timeout = Duration::from_secs(secs.max(1));
        }
        Ok(settings)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpstreamMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

/// Body of a streaming `chat/completions` call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub temperature: f32,
    pub stream: bool,
}

impl UpstreamRequest {
    pub fn new(settings: &UpstreamSettings, prompt: &str, image_url: Option<&str>) -> Self {
        let user_content = match image_url.filter(|url| !url.is_empty()) {
            Some(url) => MessageContent::Parts(vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: url.to_string(),
                    },
                },
            ]),
            None => MessageContent::Text(prompt.to_string()),
        };
        Self {
            model: settings.model.clone(),
            messages: vec![
                UpstreamMessage {
                    role: "system",
                    content: MessageContent::Text(settings.system_prompt.clone()),
                },
                UpstreamMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            temperature: settings.temperature,
            stream: true,
        }
    }
}

/// One streaming attempt against the upstream service.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &UpstreamRequest) -> Result<FragmentStream, UpstreamError>;
}

pub struct RetryingUpstreamClient {
    transport: Arc<dyn ChatTransport>,
    settings: UpstreamSettings,
}

impl RetryingUpstreamClient {
    pub fn new(transport: Arc<dyn ChatTransport>, settings: UpstreamSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Client talking HTTP to the endpoint described by `settings`.
    pub fn over_http(settings: UpstreamSettings) -> Result<Self, UpstreamError> {
        let transport = HttpChatTransport::new(settings.clone())?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    pub fn settings(&self) -> &UpstreamSettings {
        &self.settings
    }

    /// Stream generated text for `prompt`. Never fails: after the last
    /// failed attempt a single fragment starting with `Error:` is yielded.
    pub fn generate(&self, prompt: &str, image_url: Option<&str>) -> BoxStream<'static, String> {
        let transport = self.transport.clone();
        let request = UpstreamRequest::new(&self.settings, prompt, image_url);
        let attempts = self.settings.attempts();
        let delay = self.settings.retry_delay;
        let model = self.settings.model.clone();

        async_stream::stream! {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let failure = match transport.open(&request).await {
                    Ok(mut fragments) => {
                        let mut failure = None;
                        while let Some(item) = fragments.next().await {
                            match item {
                                Ok(text) => {
                                    if !text.is_empty() {
                                        yield text;
                                    }
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        failure
                    }
                    Err(e) => Some(e),
                };

                match failure {
                    None => break,
                    Some(err) if attempt >= attempts => {
                        tracing::error!(model = %model, attempt, error = %err, "Upstream generation failed");
                        yield format!("Error: upstream generation failed after {} attempt(s): {}", attempt, err);
                        break;
                    }
                    Some(err) => {
                        tracing::warn!(
                            model = %model,
                            attempt,
                            attempts,
                            error = %err,
                            "Upstream attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        .boxed()
    }

    /// Blocking view of [`generate`](Self::generate) for pipeline worker
    /// threads. Must not be iterated from inside the runtime's own threads.
    pub fn generate_blocking(
        &self,
        runtime: Handle,
        prompt: &str,
        image_url: Option<&str>,
    ) -> BlockingFragments {
        BlockingFragments {
            runtime,
            stream: self.generate(prompt, image_url),
        }
    }
}

pub struct BlockingFragments {
    runtime: Handle,
    stream: BoxStream<'static, String>,
}

impl Iterator for BlockingFragments {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.runtime.block_on(self.stream.next())
    }
}
