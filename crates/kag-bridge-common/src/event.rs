use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome flag carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    #[default]
    Ok,
    Error,
}

#[derive(Debug, Error)]
#[error("Invalid event status '{0}'. Valid values: OK, ERROR")]
pub struct ParseStatusError(String);

impl std::str::FromStr for EventStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" | "FINISH" | "RUNNING" => Ok(EventStatus::Ok),
            "ERROR" => Ok(EventStatus::Error),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Ok => write!(f, "OK"),
            EventStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Where an event came from.
///
/// Stage reports are delta-encoded per tag; results and fallbacks are
/// free-form text compared against the running content cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A `report` call made by the pipeline while it runs.
    Stage,
    /// The pipeline's final return value.
    Result,
    /// A message synthesized by the bridge instead of pipeline output.
    Fallback,
}

/// One immutable progress update produced during a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub segment: String,
    pub tag: String,
    pub content: String,
    pub status: EventStatus,
    pub origin: EventOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn stage(
        segment: impl Into<String>,
        tag: impl Into<String>,
        content: impl Into<String>,
        status: EventStatus,
    ) -> Self {
        Self {
            segment: segment.into(),
            tag: tag.into(),
            content: content.into(),
            status,
            origin: EventOrigin::Stage,
            extra: None,
            timestamp: Utc::now(),
        }
    }

    /// Wrap a pipeline's final answer.
    pub fn result(content: impl Into<String>) -> Self {
        Self {
            segment: "answer".to_string(),
            tag: "final_result".to_string(),
            content: content.into(),
            status: EventStatus::Ok,
            origin: EventOrigin::Result,
            extra: None,
            timestamp: Utc::now(),
        }
    }

    /// A synthesized answer used when the pipeline cannot produce one.
    pub fn fallback(tag: impl Into<String>, content: impl Into<String>, status: EventStatus) -> Self {
        Self {
            segment: "answer".to_string(),
            tag: tag.into(),
            content: content.into(),
            status,
            origin: EventOrigin::Fallback,
            extra: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == EventStatus::Error
    }
}
