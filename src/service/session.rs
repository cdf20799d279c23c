use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use kag_bridge_common::Event;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{PipelineContext, PipelineRegistry};
use crate::channel::BlockingEventChannel;
use crate::errors::PipelineError;
use crate::recorder::StageRecorder;

type Outcome = Result<Option<String>, PipelineError>;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// One query's channel and worker.
///
/// The worker thread constructs and runs the pipeline, then ends the
/// channel and reports the outcome. Dropping the session before that
/// cancels it: the channel closes and reporters see `is_cancelled()`, but
/// the worker itself runs on until the pipeline returns.
pub struct Session {
    id: u64,
    channel: Arc<BlockingEventChannel>,
    outcome: Option<oneshot::Receiver<Outcome>>,
}

/// Ends the channel however the worker exits.
struct EndOnDrop(Arc<BlockingEventChannel>);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.send_end();
    }
}

impl Session {
    pub fn start(
        query: &str,
        pipeline_config: Value,
        ctx: PipelineContext,
        registry: Arc<PipelineRegistry>,
        poll_interval: Duration,
    ) -> Result<Self, PipelineError> {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(BlockingEventChannel::with_cancellation(
            poll_interval,
            ctx.cancel.clone(),
        ));
        let (tx, rx) = oneshot::channel();

        let worker_channel = channel.clone();
        let query = query.to_string();
        std::thread::Builder::new()
            .name(format!("kag-session-{}", id))
            .spawn(move || {
                let span = tracing::info_span!("session", id, project_id = %ctx.project_id);
                let _entered = span.enter();

                let end = EndOnDrop(worker_channel.clone());
                let recorder = StageRecorder::new(worker_channel);
                let outcome = run_pipeline(&registry, &pipeline_config, &ctx, &query, &recorder);
                drop(end);

                if tx.send(outcome).is_err() {
                    tracing::debug!("Session consumer is gone; discarding pipeline outcome");
                }
            })
            .map_err(PipelineError::SpawnFailed)?;

        Ok(Self {
            id,
            channel,
            outcome: Some(rx),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Arc<BlockingEventChannel> {
        &self.channel
    }

    /// Next reported event, or `None` once the worker has ended the channel
    /// and everything buffered was delivered.
    pub async fn next_event(&self) -> Option<Event> {
        self.channel.recv().await
    }

    /// The pipeline's return value. Call after the events are drained.
    pub async fn finish(&mut self) -> Outcome {
        match self.outcome.take() {
            Some(rx) => rx.await.unwrap_or(Err(PipelineError::WorkerLost)),
            None => Err(PipelineError::WorkerLost),
        }
    }

    pub fn cancel(&self) {
        self.channel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.outcome.is_some() && !self.channel.is_closed() {
            tracing::info!(session = self.id, "Session dropped before completion; cancelling");
        }
        self.channel.cancel();
    }
}

fn run_pipeline(
    registry: &PipelineRegistry,
    config: &Value,
    ctx: &PipelineContext,
    query: &str,
    recorder: &StageRecorder,
) -> Outcome {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let pipeline = registry.construct(config, ctx)?;
        pipeline.invoke(query, recorder).map_err(PipelineError::from)
    }))
    .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))));

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(result) => tracing::info!(
            elapsed_ms,
            has_result = result.is_some(),
            "Pipeline finished"
        ),
        Err(e) => tracing::error!(elapsed_ms, error = %e, "Pipeline failed"),
    }
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{PipelineFactory, ProjectConfig, SolverPipeline};
    use crate::config::UpstreamSection;
    use kag_bridge_common::EventStatus;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    /// Reports until the session is cancelled, then raises `stopped`.
    struct UntilCancelled {
        stopped: Arc<AtomicBool>,
    }

    impl SolverPipeline for UntilCancelled {
        fn invoke(&self, _query: &str, reporter: &StageRecorder) -> anyhow::Result<Option<String>> {
            let mut text = String::new();
            let deadline = Instant::now() + Duration::from_secs(10);
            while !reporter.is_cancelled() && Instant::now() < deadline {
                text.push('.');
                reporter.report("answer", &text, EventStatus::Ok);
                std::thread::sleep(Duration::from_millis(5));
            }
            self.stopped.store(reporter.is_cancelled(), Ordering::SeqCst);
            Ok(Some(text))
        }
    }

    struct UntilCancelledFactory(Arc<AtomicBool>);

    impl PipelineFactory for UntilCancelledFactory {
        fn construct(
            &self,
            _config: &Value,
            _ctx: &PipelineContext,
        ) -> Result<Box<dyn SolverPipeline>, PipelineError> {
            Ok(Box::new(UntilCancelled {
                stopped: self.0.clone(),
            }))
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext {
            project_id: "1".into(),
            host_addr: "http://h".into(),
            config: Arc::new(ProjectConfig::default()),
            upstream: UpstreamSection::default(),
            runtime: tokio::runtime::Handle::current(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn dropping_session_cancels_cooperative_pipeline() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut registry = PipelineRegistry::new();
        registry.register("loop", Arc::new(UntilCancelledFactory(stopped.clone())));

        let session = Session::start(
            "q",
            json!({"type": "loop"}),
            ctx(),
            Arc::new(registry),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(session.next_event().await.is_some());
        let channel = session.channel().clone();
        drop(session);

        assert!(channel.is_cancelled());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !stopped.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_type_fails_on_worker() {
        let mut session = Session::start(
            "q",
            json!({"type": "nope"}),
            ctx(),
            Arc::new(PipelineRegistry::new()),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(session.next_event().await.is_none());
        assert!(matches!(session.finish().await, Err(PipelineError::UnknownType(_))));
        assert!(matches!(session.finish().await, Err(PipelineError::WorkerLost)));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
