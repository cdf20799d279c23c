//! Progress sink handed to solver pipelines.
//!
//! Every `report` call records the line, refreshes the per-tag snapshot and
//! pushes an [`Event`] built from that snapshot into the session channel.
//! Identical content is not deduplicated here; the delta encoder suppresses
//! no-op updates downstream.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kag_bridge_common::{Event, EventStatus};
use serde_json::Value;

use crate::channel::BlockingEventChannel;
use crate::util::strip_empty_fields;

/// Optional observer invoked synchronously with every emitted event.
pub type ReportCallback = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

pub struct StageRecorder {
    channel: Arc<BlockingEventChannel>,
    snapshots: Mutex<HashMap<String, Event>>,
    lines: Mutex<Vec<Event>>,
    callback: Option<ReportCallback>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StageRecorder {
    pub fn new(channel: Arc<BlockingEventChannel>) -> Self {
        Self {
            channel,
            snapshots: Mutex::new(HashMap::new()),
            lines: Mutex::new(Vec::new()),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ReportCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Report progress for `tag`, using the tag as its own segment.
    pub fn report(&self, tag: &str, content: &str, status: EventStatus) {
        self.report_line(tag, tag, content, status, None);
    }

    /// Report progress for `tag` within `segment`, with optional structured
    /// details attached to the event.
    pub fn report_line(
        &self,
        segment: &str,
        tag: &str,
        content: &str,
        status: EventStatus,
        extra: Option<Value>,
    ) {
        let extra = extra.and_then(strip_empty_fields);
        let line = Event::stage(segment, tag, content, status);
        let line = match extra.clone() {
            Some(extra) => line.with_extra(extra),
            None => line,
        };
        lock(&self.lines).push(line.clone());

        let snapshot = {
            let mut snapshots = lock(&self.snapshots);
            let entry = snapshots.entry(tag.to_string()).or_insert_with(|| line.clone());
            entry.segment = line.segment.clone();
            entry.content = line.content.clone();
            entry.status = line.status;
            entry.timestamp = line.timestamp;
            if extra.is_some() {
                entry.extra = extra;
            }
            entry.clone()
        };

        tracing::debug!(
            segment = %snapshot.segment,
            tag = %snapshot.tag,
            status = %snapshot.status,
            len = snapshot.content.len(),
            "Stage report"
        );

        if let Some(callback) = &self.callback {
            match catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Error in report callback"),
                Err(_) => tracing::error!("Report callback panicked"),
            }
        }

        self.channel.send(snapshot);
    }

    /// Latest content reported for `tag`.
    pub fn latest(&self, tag: &str) -> Option<String> {
        lock(&self.snapshots).get(tag).map(|e| e.content.clone())
    }

    /// Every line reported so far, in call order.
    pub fn lines(&self) -> Vec<Event> {
        lock(&self.lines).clone()
    }

    /// Cooperative checkpoint for pipelines: true once the consumer is gone.
    pub fn is_cancelled(&self) -> bool {
        self.channel.is_cancelled()
    }
}
