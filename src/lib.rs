//! Streaming bridge that exposes knowledge-base reasoning pipelines behind an
//! OpenAI-compatible chat completions API.
//!
//! A request flows through these pieces:
//!
//! - [`service::PipelineInvoker`] resolves the project and starts a
//!   [`service::Session`], which runs a blocking pipeline on its own thread.
//! - The pipeline reports progress through a [`recorder::StageRecorder`]
//!   into a [`channel::BlockingEventChannel`].
//! - [`delta::DeltaStreamEncoder`] turns the event stream into incremental
//!   chat completion chunks served by [`server`].
//! - Pipelines that call a language model use
//!   [`upstream::RetryingUpstreamClient`].

pub mod channel;
pub mod config;
pub mod delta;
pub mod errors;
pub mod pipelines;
pub mod recorder;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod upstream;
pub mod util;
