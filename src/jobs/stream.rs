//! Bounded single-producer/single-consumer event stream for one job
//!
//! A stream carries zero or more `status` events, then one `result` or
//! `error`, then exactly one `complete`. Status updates are best effort:
//! they are dropped rather than block the producer once the buffer is
//! down to the slots reserved for the terminal events.

use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Buffer slots held back for the `result`/`error` and `complete` events
pub const TERMINAL_RESERVE: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultEvent {
    Status(String),
    Result(Value),
    Error(String),
    Complete,
}

impl ResultEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Event name on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Complete => "complete",
        }
    }

    /// JSON payload on the wire
    pub fn payload(&self) -> Value {
        match self {
            Self::Status(message) | Self::Error(message) => json!({ "message": message }),
            Self::Result(data) => data.clone(),
            Self::Complete => json!({}),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Server-sent-events frame: `event: <kind>\ndata: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind(), self.payload())
    }
}

/// Create a stream with room for `capacity` pending events
pub fn channel(capacity: usize) -> (EventSender, ResultStream) {
    let (tx, rx) = mpsc::channel(capacity.max(TERMINAL_RESERVE + 1));
    (EventSender { tx }, ResultStream { rx, done: false })
}

/// Producer half
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ResultEvent>,
}

impl EventSender {
    /// Send an event, waiting for buffer space. Returns `false` once the
    /// consumer is gone.
    pub async fn send(&self, event: ResultEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Best-effort status update from synchronous code
    ///
    /// Returns `false` if the update was dropped.
    pub fn try_status(&self, message: impl Into<String>) -> bool {
        if self.tx.capacity() <= TERMINAL_RESERVE {
            return false;
        }
        self.tx.try_send(ResultEvent::status(message)).is_ok()
    }
}

/// Consumer half
#[derive(Debug)]
pub struct ResultStream {
    rx: mpsc::Receiver<ResultEvent>,
    done: bool,
}

impl ResultStream {
    /// Next event in production order; `None` after `complete`
    ///
    /// If the producer disappears without sending `complete`, one is
    /// synthesized so the consumer still sees a terminated stream.
    pub async fn next(&mut self) -> Option<ResultEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or(ResultEvent::Complete);
        if event.is_complete() {
            self.done = true;
            self.rx.close();
        }
        Some(event)
    }

    /// Drain the stream up to and including `complete`
    pub async fn collect(mut self) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, rx) = channel(8);
        assert!(tx.send(ResultEvent::status("Starting")).await);
        assert!(tx.send(ResultEvent::Result(json!({"x": 1}))).await);
        assert!(tx.send(ResultEvent::Complete).await);

        let events = rx.collect().await;
        let kinds: Vec<&str> = events.iter().map(ResultEvent::kind).collect();
        assert_eq!(kinds, vec!["status", "result", "complete"]);
    }

    #[tokio::test]
    async fn test_dropped_producer_still_completes() {
        let (tx, rx) = channel(4);
        tx.send(ResultEvent::status("Starting")).await;
        drop(tx);
        let events = rx.collect().await;
        assert_eq!(events.last(), Some(&ResultEvent::Complete));
        assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_after_complete() {
        let (tx, mut rx) = channel(4);
        tx.send(ResultEvent::Complete).await;
        tx.send(ResultEvent::status("late")).await;
        assert_eq!(rx.next().await, Some(ResultEvent::Complete));
        assert_eq!(rx.next().await, None);
    }

    #[test]
    fn test_status_is_lossy_but_reserves_terminal_slots() {
        let (tx, _rx) = channel(4);
        assert!(tx.try_status("a"));
        assert!(tx.try_status("b"));
        // Two slots left, both reserved
        assert!(!tx.try_status("c"));
    }

    #[test]
    fn test_sse_frames() {
        assert_eq!(
            ResultEvent::status("Starting computation...").to_sse_frame(),
            "event: status\ndata: {\"message\":\"Starting computation...\"}\n\n"
        );
        assert_eq!(ResultEvent::Complete.to_sse_frame(), "event: complete\ndata: {}\n\n");
        assert_eq!(
            ResultEvent::Result(json!([1, 2])).to_sse_frame(),
            "event: result\ndata: [1,2]\n\n"
        );
    }
}
