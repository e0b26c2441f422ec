//! Fire-and-forget progress reporting.
//!
//! Publishing never fails from the caller's point of view; a sink that cannot
//! deliver an event drops it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub stage: String,
    pub fields: Map<String, Value>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    #[must_use]
    pub fn new(task_id: &str, stage: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            stage: stage.to_string(),
            fields: Map::new(),
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn publish(&self, event: ProgressEvent) {
        info!(
            task_id = %event.task_id,
            stage = %event.stage,
            fields = %serde_json::Value::Object(event.fields),
            "Progress"
        );
    }
}

/// Forwards events to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn publish(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("Progress receiver gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivers_and_survives_closed_receiver() {
        let (sink, mut rx) = ChannelProgress::new();
        sink.publish(ProgressEvent::new("t1", "discovery").with("found", 3));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.stage, "discovery");
        assert_eq!(event.fields.get("found"), Some(&Value::from(3)));

        drop(rx);
        sink.publish(ProgressEvent::new("t1", "done"));
    }
}
