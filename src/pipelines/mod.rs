//! Pipelines shipped with the bridge.

mod direct_answer;

use std::sync::Arc;

use crate::service::PipelineRegistry;

pub use direct_answer::{DirectAnswer, DirectAnswerFactory};

pub const DIRECT_ANSWER: &str = "direct_answer";

pub fn register_builtins(registry: &mut PipelineRegistry) {
    registry.register(DIRECT_ANSWER, Arc::new(DirectAnswerFactory));
}
