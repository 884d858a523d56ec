//! In-process log fan-out backing `GET /admin/logs/stream`.
//!
//! A tracing `Layer` captures formatted events into a bounded ring (for
//! replay) and a broadcast channel (for live SSE subscribers).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const RING_CAPACITY: usize = 1000;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

pub struct LogBuffer {
    ring: Mutex<VecDeque<LogLine>>,
    tx: broadcast::Sender<LogLine>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)), tx }
    }

    pub fn append(&self, line: LogLine) {
        {
            let mut ring = self.ring.lock();
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        let _ = self.tx.send(line);
    }

    /// Most recent lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogLine> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// tracing layer feeding the buffer.
pub struct BroadcastLayer {
    buffer: Arc<LogBuffer>,
}

impl BroadcastLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer.append(LogLine {
            timestamp: Utc::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(msg: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            level: "INFO".to_string(),
            target: "test".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn ring_is_bounded_and_ordered() {
        let buffer = LogBuffer::new();
        for i in 0..(RING_CAPACITY + 10) {
            buffer.append(line(&format!("line {}", i)));
        }
        let recent = buffer.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.last().unwrap().message, format!("line {}", RING_CAPACITY + 9));
        assert_eq!(buffer.recent(usize::MAX).len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn subscribers_receive_appends() {
        let buffer = LogBuffer::new();
        let mut rx = buffer.subscribe();
        buffer.append(line("hello"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message, "hello");
    }
}
