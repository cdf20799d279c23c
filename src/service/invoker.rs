use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use kag_bridge_common::{Event, EventStatus};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{
    ERROR_REPLY, ERROR_TAG, MISSING_CONFIG_TAG, PipelineContext, PipelineRegistry, ProjectCatalog,
    ProjectClient, Session, missing_config_reply,
};
use crate::channel::DEFAULT_POLL_INTERVAL;
use crate::config::UpstreamSection;
use crate::util::truncate_for_log;

/// Turns a query into a stream of events. Failures never escape: they
/// become a single terminal fallback event.
#[derive(Clone)]
pub struct PipelineInvoker {
    projects: Arc<dyn ProjectClient>,
    catalog: Arc<ProjectCatalog>,
    registry: Arc<PipelineRegistry>,
    upstream: UpstreamSection,
    poll_interval: Duration,
}

impl PipelineInvoker {
    pub fn new(
        projects: Arc<dyn ProjectClient>,
        catalog: Arc<ProjectCatalog>,
        registry: Arc<PipelineRegistry>,
    ) -> Self {
        Self {
            projects,
            catalog,
            registry,
            upstream: UpstreamSection::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_upstream(mut self, upstream: UpstreamSection) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn catalog(&self) -> &Arc<ProjectCatalog> {
        &self.catalog
    }

    pub fn projects(&self) -> &Arc<dyn ProjectClient> {
        &self.projects
    }

    /// Run `query` against the project named or numbered by `project_key`.
    ///
    /// Events arrive in the order the pipeline reported them, followed by
    /// the pipeline's final result when it returned a non-empty one.
    /// Dropping the stream cancels the session.
    pub fn invoke(&self, query: &str, project_key: &str) -> BoxStream<'static, Event> {
        let this = self.clone();
        let query = query.to_string();
        let key = project_key.to_string();

        async_stream::stream! {
            let project_id = this.catalog.resolve(&key);
            tracing::info!(
                project_key = %key,
                project_id = %project_id,
                query = %truncate_for_log(&query, 80),
                "Starting query"
            );

            let config = match this.projects.load_config(&project_id).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(project_id = %project_id, error = %e, "Failed to resolve project config");
                    yield error_fallback();
                    return;
                }
            };

            let Some(pipeline_config) = config.solver_pipeline().cloned() else {
                tracing::warn!(project_id = %project_id, "No solver_pipeline configured; sending default reply");
                yield Event::fallback(MISSING_CONFIG_TAG, missing_config_reply(&project_id), EventStatus::Ok);
                return;
            };

            let runtime = match Handle::try_current() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "No async runtime available for pipeline worker");
                    yield error_fallback();
                    return;
                }
            };

            let ctx = PipelineContext {
                project_id: project_id.clone(),
                host_addr: this.projects.host_addr().to_string(),
                config: Arc::new(config),
                upstream: this.upstream.clone(),
                runtime,
                cancel: CancellationToken::new(),
            };

            let mut session = match Session::start(
                &query,
                pipeline_config,
                ctx,
                this.registry.clone(),
                this.poll_interval,
            ) {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(project_id = %project_id, error = %e, "Failed to start session");
                    yield error_fallback();
                    return;
                }
            };

            while let Some(event) = session.next_event().await {
                yield event;
            }

            match session.finish().await {
                Ok(Some(result)) if !result.is_empty() => yield Event::result(result),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(project_id = %project_id, session = session.id(), error = %e, "Query failed");
                    yield error_fallback();
                }
            }
        }
        .boxed()
    }
}

fn error_fallback() -> Event {
    Event::fallback(ERROR_TAG, ERROR_REPLY, EventStatus::Error)
}
