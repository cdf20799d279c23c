use async_trait::async_trait;
use futures::StreamExt;

use super::sse::{LineBuffer, SseLine, parse_line};
use super::{ChatTransport, EndpointMode, FragmentStream, UpstreamRequest, UpstreamSettings};
use crate::errors::UpstreamError;

/// Maximum characters of an error body kept in [`UpstreamError::Status`].
const ERROR_BODY_LIMIT: usize = 500;

/// reqwest-backed transport. One instance per configured endpoint; the
/// underlying client pools connections across attempts.
pub struct HttpChatTransport {
    client: reqwest::Client,
    settings: UpstreamSettings,
}

impl HttpChatTransport {
    pub fn new(settings: UpstreamSettings) -> Result<Self, UpstreamError> {
        if matches!(settings.endpoint, EndpointMode::Azure { .. }) && settings.api_key.is_none() {
            return Err(UpstreamError::MissingApiKey {
                base_url: settings.base_url.clone(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .build()
            .map_err(UpstreamError::Network)?;
        Ok(Self { client, settings })
    }

    pub fn endpoint_url(&self) -> String {
        match &self.settings.endpoint {
            EndpointMode::Standard => format!("{}/chat/completions", self.settings.base_url),
            EndpointMode::Azure { deployment, .. } => format!(
                "{}/openai/deployments/{}/chat/completions",
                self.settings.base_url, deployment
            ),
        }
    }

    fn timeout_secs(&self) -> u64 {
        self.settings.timeout.as_secs()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open(&self, request: &UpstreamRequest) -> Result<FragmentStream, UpstreamError> {
        let timeout_secs = self.timeout_secs();
        let mut builder = self
            .client
            .post(self.endpoint_url())
            .timeout(self.settings.timeout)
            .json(request);
        builder = match (&self.settings.endpoint, self.settings.api_key.as_deref()) {
            (EndpointMode::Standard, Some(key)) => builder.bearer_auth(key),
            (EndpointMode::Standard, None) => builder,
            (EndpointMode::Azure { api_version, .. }, key) => builder
                .query(&[("api-version", api_version.as_str())])
                .header("api-key", key.unwrap_or_default()),
        };

        tracing::debug!(url = %self.endpoint_url(), model = %request.model, "Opening upstream stream");
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: crate::util::truncate_for_log(&body, ERROR_BODY_LIMIT),
            });
        }

        let mut bytes = response.bytes_stream();
        let fragments = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut finished = false;
            'body: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(UpstreamError::from_reqwest(e, timeout_secs));
                        finished = true;
                        break 'body;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_line(&line) {
                        Ok(SseLine::Fragment(text)) => yield Ok(text),
                        Ok(SseLine::Skip) => {}
                        Ok(SseLine::Done) => {
                            finished = true;
                            break 'body;
                        }
                        Err(e) => {
                            yield Err(e);
                            finished = true;
                            break 'body;
                        }
                    }
                }
            }
            if !finished && let Some(tail) = lines.finish() {
                match parse_line(&tail) {
                    Ok(SseLine::Fragment(text)) => yield Ok(text),
                    Ok(_) => {}
                    Err(e) => yield Err(e),
                }
            }
        };
        Ok(fragments.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamSection;

    fn settings(endpoint: EndpointMode, api_key: Option<&str>) -> UpstreamSettings {
        let mut settings =
            UpstreamSettings::new("https://llm.example.com/v1", "m", &UpstreamSection::default());
        settings.endpoint = endpoint;
        settings.api_key = api_key.map(str::to_string);
        settings
    }

    #[test]
    fn standard_endpoint_url() {
        let transport = HttpChatTransport::new(settings(EndpointMode::Standard, None)).unwrap();
        assert_eq!(
            transport.endpoint_url(),
            "https://llm.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn azure_endpoint_url_uses_deployment() {
        let endpoint = EndpointMode::Azure {
            deployment: "gpt4o-prod".into(),
            api_version: "2024-06-01".into(),
        };
        let transport = HttpChatTransport::new(settings(endpoint, Some("k"))).unwrap();
        assert_eq!(
            transport.endpoint_url(),
            "https://llm.example.com/v1/openai/deployments/gpt4o-prod/chat/completions"
        );
    }

    #[test]
    fn azure_without_key_is_rejected() {
        let endpoint = EndpointMode::Azure {
            deployment: "d".into(),
            api_version: "v".into(),
        };
        let err = HttpChatTransport::new(settings(endpoint, None)).err().unwrap();
        assert!(matches!(err, UpstreamError::MissingApiKey { .. }));
    }
}
