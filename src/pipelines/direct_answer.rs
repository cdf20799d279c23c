//! Single-stage pipeline: ask the configured LLM and stream its answer.
//!
//! ```json
//! {
//!   "type": "direct_answer",
//!   "prompt_template": "Answer briefly: {query}",
//!   "llm_client": {
//!     "type": "stream_openai_llm",
//!     "base_url": "https://api.openai.com/v1",
//!     "api_key": "sk-...",
//!     "model": "gpt-4o-mini"
//!   }
//! }
//! ```

use kag_bridge_common::EventStatus;
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::errors::PipelineError;
use crate::recorder::StageRecorder;
use crate::service::{PipelineContext, PipelineFactory, SolverPipeline};
use crate::upstream::{RetryingUpstreamClient, UpstreamSettings};

const ANSWER_TAG: &str = "answer";
const QUERY_PLACEHOLDER: &str = "{query}";

#[derive(Debug, Deserialize)]
struct DirectAnswerConfig {
    llm_client: Value,
    #[serde(default)]
    prompt_template: Option<String>,
}

pub struct DirectAnswerFactory;

impl PipelineFactory for DirectAnswerFactory {
    fn construct(
        &self,
        config: &Value,
        ctx: &PipelineContext,
    ) -> Result<Box<dyn SolverPipeline>, PipelineError> {
        let config: DirectAnswerConfig = serde_json::from_value(config.clone())
            .map_err(|e| PipelineError::InvalidConfig(format!("direct_answer: {}", e)))?;
        let settings = UpstreamSettings::from_client_value(&config.llm_client, &ctx.upstream)?;
        let client = RetryingUpstreamClient::over_http(settings)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        Ok(Box::new(DirectAnswer::new(
            client,
            ctx.runtime.clone(),
            config.prompt_template,
        )))
    }
}

pub struct DirectAnswer {
    client: RetryingUpstreamClient,
    runtime: Handle,
    prompt_template: Option<String>,
}

impl DirectAnswer {
    pub fn new(client: RetryingUpstreamClient, runtime: Handle, prompt_template: Option<String>) -> Self {
        Self {
            client,
            runtime,
            prompt_template,
        }
    }

    fn prompt(&self, query: &str) -> String {
        match &self.prompt_template {
            Some(template) if template.contains(QUERY_PLACEHOLDER) => {
                template.replace(QUERY_PLACEHOLDER, query)
            }
            Some(template) => format!("{}\n\n{}", template, query),
            None => query.to_string(),
        }
    }
}

impl SolverPipeline for DirectAnswer {
    fn invoke(&self, query: &str, reporter: &StageRecorder) -> anyhow::Result<Option<String>> {
        let prompt = self.prompt(query);
        let mut answer = String::new();

        for fragment in self.client.generate_blocking(self.runtime.clone(), &prompt, None) {
            if reporter.is_cancelled() {
                tracing::debug!(chars = answer.chars().count(), "Cancelled; abandoning generation");
                break;
            }
            answer.push_str(&fragment);
            reporter.report(ANSWER_TAG, &answer, EventStatus::Ok);
        }

        Ok((!answer.is_empty()).then_some(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BlockingEventChannel, Recv};
    use crate::config::UpstreamSection;
    use crate::errors::UpstreamError;
    use crate::service::ProjectConfig;
    use crate::upstream::{ChatTransport, FragmentStream, UpstreamRequest};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    struct Canned {
        fragments: Vec<&'static str>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatTransport for Canned {
        async fn open(&self, request: &UpstreamRequest) -> Result<FragmentStream, UpstreamError> {
            let body = serde_json::to_value(request).unwrap();
            self.prompts
                .lock()
                .unwrap()
                .push(body["messages"][1]["content"].as_str().unwrap_or_default().to_string());
            let items: Vec<Result<String, UpstreamError>> =
                self.fragments.iter().map(|f| Ok(f.to_string())).collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    fn pipeline(
        fragments: Vec<&'static str>,
        template: Option<&str>,
        runtime: &tokio::runtime::Runtime,
    ) -> (DirectAnswer, Arc<Canned>) {
        let transport = Arc::new(Canned {
            fragments,
            prompts: Mutex::new(Vec::new()),
        });
        let settings = UpstreamSettings::new("http://llm.test/v1", "m", &UpstreamSection::default());
        let client = RetryingUpstreamClient::new(transport.clone(), settings);
        (
            DirectAnswer::new(client, runtime.handle().clone(), template.map(str::to_string)),
            transport,
        )
    }

    fn drain(channel: &BlockingEventChannel) -> Vec<String> {
        let mut out = Vec::new();
        while let Recv::Event(event) = channel.try_recv() {
            out.push(event.content);
        }
        out
    }

    #[test]
    fn streams_growing_answer_and_returns_it() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (pipeline, _) = pipeline(vec!["Par", "is"], None, &runtime);
        let channel = Arc::new(BlockingEventChannel::default());
        let reporter = StageRecorder::new(channel.clone());

        let result = pipeline.invoke("capital of France?", &reporter).unwrap();
        assert_eq!(result.as_deref(), Some("Paris"));
        assert_eq!(drain(&channel), vec!["Par", "Paris"]);
        assert_eq!(reporter.latest(ANSWER_TAG).as_deref(), Some("Paris"));
    }

    #[test]
    fn prompt_template_wraps_query() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (pipeline, transport) = pipeline(vec!["ok"], Some("Q: {query}\nA:"), &runtime);
        let reporter = StageRecorder::new(Arc::new(BlockingEventChannel::default()));

        pipeline.invoke("why?", &reporter).unwrap();
        assert_eq!(transport.prompts.lock().unwrap().as_slice(), ["Q: why?\nA:"]);
    }

    #[test]
    fn template_without_placeholder_is_prefixed() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (pipeline, _) = pipeline(vec![], Some("Be brief."), &runtime);
        assert_eq!(pipeline.prompt("why?"), "Be brief.\n\nwhy?");
    }

    #[test]
    fn cancelled_session_stops_reporting() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (pipeline, _) = pipeline(vec!["a", "b", "c"], None, &runtime);
        let channel = Arc::new(BlockingEventChannel::default());
        channel.cancel();
        let reporter = StageRecorder::new(channel.clone());

        let result = pipeline.invoke("q", &reporter).unwrap();
        assert!(result.is_none());
        assert!(reporter.lines().is_empty());
    }

    #[test]
    fn factory_rejects_missing_llm_client() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let ctx = PipelineContext {
            project_id: "1".into(),
            host_addr: "http://h".into(),
            config: Arc::new(ProjectConfig::default()),
            upstream: UpstreamSection::default(),
            runtime: runtime.handle().clone(),
            cancel: CancellationToken::new(),
        };
        let err = DirectAnswerFactory
            .construct(&json!({"type": "direct_answer"}), &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));

        let ok = DirectAnswerFactory.construct(
            &json!({
                "type": "direct_answer",
                "llm_client": {"type": "stream_openai_llm", "base_url": "http://llm", "model": "m"}
            }),
            &ctx,
        );
        assert!(ok.is_ok());
    }
}
