//! Typed error hierarchy for kag-bridge.
//!
//! Three top-level enums cover the three outbound collaborators:
//! - `UpstreamError`: streaming text-generation calls
//! - `ProjectError`: project listing and configuration lookup
//! - `PipelineError`: solver pipeline construction and execution
//!
//! None of these cross a session boundary: the invoker and the retrying
//! client turn them into terminal events or fragments.

use thiserror::Error;

/// Errors from a single streaming call to the text-generation endpoint.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Upstream request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed upstream stream: {0}")]
    MalformedStream(String),

    #[error("No API key configured for upstream {base_url}")]
    MissingApiKey { base_url: String },
}

impl UpstreamError {
    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout { secs: timeout_secs }
        } else {
            UpstreamError::Network(err)
        }
    }
}

/// Errors from the project configuration service.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Project service request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Project service returned HTTP {status}")]
    Status { status: u16 },

    #[error("Malformed project service response: {0}")]
    Decode(String),

    #[error("Invalid config for project {project_id}: {source}")]
    InvalidConfig {
        project_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from constructing or running a solver pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("solver_pipeline config has no 'type' field")]
    MissingType,

    #[error("Unknown solver pipeline type '{0}'")]
    UnknownType(String),

    #[error("Invalid solver pipeline config: {0}")]
    InvalidConfig(String),

    #[error("Pipeline worker exited without reporting an outcome")]
    WorkerLost,

    #[error("Pipeline panicked: {0}")]
    Panicked(String),

    #[error("Failed to spawn pipeline worker: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_carries_code_and_body() {
        let err = UpstreamError::Status {
            status: 503,
            body: "overloaded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("503"));
        assert!(msg.contains("overloaded"));
    }

    #[test]
    fn project_invalid_config_carries_project_id() {
        let source = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err = ProjectError::InvalidConfig {
            project_id: "42".into(),
            source,
        };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn pipeline_error_converts_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("retriever exploded").into();
        match &err {
            PipelineError::Other(inner) => assert_eq!(inner.to_string(), "retriever exploded"),
            _ => panic!("Expected PipelineError::Other"),
        }
    }

    #[test]
    fn pipeline_unknown_type_is_matchable() {
        let err = PipelineError::UnknownType("kag_static_pipeline".into());
        assert!(matches!(err, PipelineError::UnknownType(ref t) if t == "kag_static_pipeline"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&UpstreamError::Timeout { secs: 1 });
        assert_std_error(&ProjectError::Status { status: 500 });
        assert_std_error(&PipelineError::MissingType);
    }
}
