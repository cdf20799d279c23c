//! Query orchestration: project resolution, pipeline construction, and the
//! per-request [`Session`] that runs a pipeline on its own worker thread.

mod invoker;
mod project;
mod registry;
mod session;

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamSection;
use crate::errors::PipelineError;
use crate::recorder::StageRecorder;

pub use invoker::PipelineInvoker;
pub use project::{OpenSpgProjectClient, ProjectCatalog, ProjectClient, ProjectConfig, ProjectRecord};
pub use registry::PipelineRegistry;
pub use session::Session;

/// Tag of the reply sent when a project has no pipeline configured.
pub const MISSING_CONFIG_TAG: &str = "mock_answer";

/// Tag of the reply sent when a session fails.
pub const ERROR_TAG: &str = "error_answer";

pub const ERROR_REPLY: &str = "很抱歉，处理您的请求时遇到了问题。请稍后再试或联系管理员。";

pub fn missing_config_reply(project_id: &str) -> String {
    format!(
        "我是一个知识库助手，但我无法找到项目 {} 的配置。请尝试其他问题或联系管理员配置此项目。",
        project_id
    )
}

/// Everything a pipeline needs to know about the session it runs in.
///
/// Built per session, so concurrent requests for different projects never
/// observe each other's configuration.
#[derive(Clone)]
pub struct PipelineContext {
    pub project_id: String,
    pub host_addr: String,
    pub config: Arc<ProjectConfig>,
    pub upstream: UpstreamSection,
    /// Runtime used by blocking code on the worker thread to drive async I/O.
    pub runtime: Handle,
    pub cancel: CancellationToken,
}

/// A constructed, ready-to-run reasoning pipeline.
///
/// `invoke` runs on the session's worker thread and may block. Progress goes
/// through `reporter`; the return value is the final answer, if any.
pub trait SolverPipeline: Send {
    fn invoke(&self, query: &str, reporter: &StageRecorder) -> anyhow::Result<Option<String>>;
}

/// Builds pipelines of one `type` from their `solver_pipeline` config.
pub trait PipelineFactory: Send + Sync {
    fn construct(
        &self,
        config: &Value,
        ctx: &PipelineContext,
    ) -> Result<Box<dyn SolverPipeline>, PipelineError>;
}
