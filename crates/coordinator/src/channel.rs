//! Channels between the coordinator, its workers and its callers
//!
//! A worker is reached through a [`WorkerChannel`], an opaque capability
//! owned by the transport layer. Callers receive results on a bounded
//! per-request channel of [`ResultEvent`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use workerbridge_common::error::{BridgeError, Result};

/// Work forwarded to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub request_id: String,
    pub model_name: String,
    pub payload: serde_json::Value,
}

/// Send side of a worker connection.
///
/// The registry stores it without managing its lifecycle; implementations
/// must not block.
pub trait WorkerChannel: Send + Sync {
    /// Hand a job to the worker
    fn send(&self, job: WorkerJob) -> Result<()>;

    /// Ask the transport to close the connection
    fn close(&self, reason: &str);
}

/// Message observed by the transport task driving a worker connection
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Job(WorkerJob),
    Close(String),
}

/// [`WorkerChannel`] over an unbounded tokio channel, drained by the
/// transport task that owns the worker's socket
#[derive(Debug, Clone)]
pub struct MpscWorkerChannel {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl MpscWorkerChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WorkerChannel for MpscWorkerChannel {
    fn send(&self, job: WorkerJob) -> Result<()> {
        let request_id = job.request_id.clone();
        self.tx.send(WorkerMessage::Job(job)).map_err(|_| {
            BridgeError::delivery(format!(
                "worker connection closed before request '{}' was sent",
                request_id
            ))
        })
    }

    fn close(&self, reason: &str) {
        // Receiver may already be gone
        let _ = self.tx.send(WorkerMessage::Close(reason.to_string()));
    }
}

/// Event streamed back to the caller of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Partial output from the worker
    Data(serde_json::Value),

    /// Terminal error; always followed by `Done`
    Error(String),

    /// End of stream
    Done,
}

impl ResultEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultEvent::Done)
    }
}

pub type ResultSender = mpsc::Sender<ResultEvent>;
pub type ResultReceiver = mpsc::Receiver<ResultEvent>;

/// Create a bounded result channel
pub fn result_channel(buffer: usize) -> (ResultSender, ResultReceiver) {
    mpsc::channel(buffer.max(1))
}

/// Push an event, giving up after `timeout` if the consumer is not draining
pub async fn deliver(tx: &ResultSender, event: ResultEvent, timeout: Duration) -> Result<()> {
    match tx.send_timeout(event, timeout).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(BridgeError::delivery(format!(
            "result channel full for {:?}",
            timeout
        ))),
        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
            Err(BridgeError::delivery("result channel closed by consumer"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mpsc_worker_channel() {
        let (channel, mut rx) = MpscWorkerChannel::new();
        let job = WorkerJob {
            request_id: "r1".to_string(),
            model_name: "model-a".to_string(),
            payload: serde_json::json!({"prompt": "hi"}),
        };

        channel.send(job.clone()).unwrap();
        channel.close("bye");

        assert_eq!(rx.recv().await, Some(WorkerMessage::Job(job)));
        assert_eq!(rx.recv().await, Some(WorkerMessage::Close("bye".to_string())));
    }

    #[tokio::test]
    async fn test_send_after_transport_gone() {
        let (channel, rx) = MpscWorkerChannel::new();
        drop(rx);

        let result = channel.send(WorkerJob {
            request_id: "r1".to_string(),
            model_name: "model-a".to_string(),
            payload: serde_json::Value::Null,
        });
        assert!(matches!(result, Err(BridgeError::Delivery(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_is_bounded() {
        let (tx, _rx) = result_channel(1);
        deliver(&tx, ResultEvent::Done, Duration::from_millis(50))
            .await
            .unwrap();

        // Buffer is full and nobody reads
        let result = deliver(&tx, ResultEvent::Done, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BridgeError::Delivery(_))));
    }

    #[tokio::test]
    async fn test_deliver_to_dropped_receiver() {
        let (tx, rx) = result_channel(4);
        drop(rx);

        let result = deliver(&tx, ResultEvent::Error("x".into()), Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_result_event_serialization() {
        let json = serde_json::to_value(ResultEvent::Error("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "data": "boom"}));

        let json = serde_json::to_value(ResultEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));
    }
}
