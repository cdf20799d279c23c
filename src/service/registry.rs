use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{PipelineContext, PipelineFactory, SolverPipeline};
use crate::errors::PipelineError;
use crate::pipelines;

/// Maps `solver_pipeline.type` names to factories.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    factories: HashMap<String, Arc<dyn PipelineFactory>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the pipelines shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        pipelines::register_builtins(&mut registry);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn PipelineFactory>) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::warn!(pipeline_type = %name, "Replacing registered pipeline factory");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn construct(
        &self,
        config: &Value,
        ctx: &PipelineContext,
    ) -> Result<Box<dyn SolverPipeline>, PipelineError> {
        let kind = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PipelineError::MissingType)?;
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| PipelineError::UnknownType(kind.to_string()))?;
        tracing::debug!(pipeline_type = %kind, project_id = %ctx.project_id, "Constructing pipeline");
        factory.construct(config, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamSection;
    use crate::recorder::StageRecorder;
    use crate::service::ProjectConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    impl SolverPipeline for Echo {
        fn invoke(&self, query: &str, _reporter: &StageRecorder) -> anyhow::Result<Option<String>> {
            Ok(Some(query.to_string()))
        }
    }

    struct EchoFactory;

    impl PipelineFactory for EchoFactory {
        fn construct(
            &self,
            _config: &Value,
            _ctx: &PipelineContext,
        ) -> Result<Box<dyn SolverPipeline>, PipelineError> {
            Ok(Box::new(Echo))
        }
    }

    fn ctx(runtime: &tokio::runtime::Runtime) -> PipelineContext {
        PipelineContext {
            project_id: "1".into(),
            host_addr: "http://h".into(),
            config: Arc::new(ProjectConfig::default()),
            upstream: UpstreamSection::default(),
            runtime: runtime.handle().clone(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn constructs_registered_type() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut registry = PipelineRegistry::new();
        registry.register("echo", Arc::new(EchoFactory));

        let pipeline = registry.construct(&json!({"type": "echo"}), &ctx(&runtime)).unwrap();
        let channel = Arc::new(crate::channel::BlockingEventChannel::default());
        let reporter = StageRecorder::new(channel);
        assert_eq!(pipeline.invoke("q", &reporter).unwrap().as_deref(), Some("q"));
    }

    #[test]
    fn missing_and_unknown_types_fail() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let registry = PipelineRegistry::new();

        let missing = registry.construct(&json!({"name": "x"}), &ctx(&runtime)).err().unwrap();
        assert!(matches!(missing, PipelineError::MissingType));

        let unknown = registry
            .construct(&json!({"type": "kag_static_pipeline"}), &ctx(&runtime))
            .err()
            .unwrap();
        assert!(matches!(unknown, PipelineError::UnknownType(ref t) if t == "kag_static_pipeline"));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = PipelineRegistry::with_builtins();
        assert!(registry.contains(crate::pipelines::DIRECT_ANSWER));
        assert_eq!(registry.names(), vec![crate::pipelines::DIRECT_ANSWER.to_string()]);
    }
}
