//! Runs computations off the request path and terminates their streams
//!
//! `submit` returns as soon as the job id exists. The computation itself
//! runs on tokio's blocking pool; failures become `error` events and
//! every stream ends with `complete`.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{JobId, JobRegistry};
use super::stream::{EventSender, ResultEvent};
use crate::error::PatchError;

/// Progress reporting and cancellation seen by a running computation
pub trait Progress: Sync {
    /// Report a human-readable status update
    fn status(&self, message: &str);

    /// Fail with [`PatchError::Cancelled`] if the job should stop
    fn checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// No-op progress for computations run outside a job
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Progress for Silent {
    fn status(&self, _message: &str) {}
}

/// Context handed to a job's computation
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    sender: EventSender,
    cancel: CancellationToken,
}

impl Progress for JobContext {
    fn status(&self, message: &str) {
        if !self.sender.try_status(message) {
            debug!("Job {}: status update dropped ({})", self.id, message);
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PatchError::Cancelled.into());
        }
        Ok(())
    }
}

/// User-visible message for a failed computation
pub fn describe_failure(err: &anyhow::Error) -> String {
    match err.downcast_ref::<PatchError>() {
        Some(PatchError::Connection(_)) => "Remote backend connection error".to_string(),
        Some(PatchError::Cancelled) => "Job cancelled".to_string(),
        _ => format!("Processing error: {err}"),
    }
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    registry: Arc<JobRegistry>,
}

impl JobRunner {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Start `work` in the background and return its job id immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, T>(&self, label: &'static str, work: F) -> JobId
    where
        F: FnOnce(&JobContext) -> Result<T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let handle = self.registry.create();
        let id = handle.id;
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let sender = handle.sender;
            sender
                .send(ResultEvent::status("Starting computation..."))
                .await;
            info!("Job {} ({}) started", id, label);

            let ctx = JobContext {
                id,
                sender: sender.clone(),
                cancel: handle.cancel,
            };
            let outcome = tokio::task::spawn_blocking(move || work(&ctx)).await;

            let event = match outcome {
                Ok(Ok(value)) => match serde_json::to_value(value) {
                    Ok(data) => {
                        info!("Job {} ({}) finished", id, label);
                        ResultEvent::Result(data)
                    }
                    Err(e) => ResultEvent::error(format!("Processing error: {e}")),
                },
                Ok(Err(err)) => {
                    warn!("Job {} ({}) failed: {:#}", id, label, err);
                    ResultEvent::error(describe_failure(&err))
                }
                Err(join_err) => {
                    warn!("Job {} ({}) panicked: {}", id, label, join_err);
                    ResultEvent::error("Processing error: computation panicked")
                }
            };

            if !sender.send(event).await {
                debug!("Job {}: listener gone before result", id);
            }
            sender.send(ResultEvent::Complete).await;
            registry.retire(&id);
        });

        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner() -> JobRunner {
        JobRunner::new(Arc::new(JobRegistry::new(16)))
    }

    #[tokio::test]
    async fn test_successful_job_stream() {
        let runner = runner();
        let id = runner.submit("test", |ctx| {
            ctx.status("halfway");
            Ok(json!({"answer": 42}))
        });
        let events = runner.registry().listen(&id).unwrap().collect().await;

        assert_eq!(events[0], ResultEvent::status("Starting computation..."));
        assert_eq!(events[1], ResultEvent::status("halfway"));
        assert_eq!(events[2], ResultEvent::Result(json!({"answer": 42})));
        assert_eq!(events[3], ResultEvent::Complete);
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_failure_becomes_error_event() {
        let runner = runner();
        let id = runner.submit("test", |_| -> Result<()> { anyhow::bail!("boom") });
        let events = runner.registry().listen(&id).unwrap().collect().await;
        assert_eq!(events[1], ResultEvent::error("Processing error: boom"));
        assert_eq!(events.last(), Some(&ResultEvent::Complete));
    }

    #[tokio::test]
    async fn test_connection_failure_message() {
        let runner = runner();
        let id = runner.submit("test", |_| -> Result<()> {
            Err(PatchError::Connection("refused".into()).into())
        });
        let events = runner.registry().listen(&id).unwrap().collect().await;
        assert_eq!(events[1], ResultEvent::error("Remote backend connection error"));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let runner = runner();
        let id = runner.submit("test", |_| -> Result<()> { panic!("kaboom") });
        let events = runner.registry().listen(&id).unwrap().collect().await;
        assert_eq!(
            events[1],
            ResultEvent::error("Processing error: computation panicked")
        );
        assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
    }

    #[tokio::test]
    async fn test_job_retired_after_consumption() {
        let runner = runner();
        let id = runner.submit("test", |_| Ok(1u32));
        let listener = runner.registry().listen(&id).unwrap();
        listener.collect().await;
        // retire runs right after `complete` is sent
        for _ in 0..100 {
            if !runner.registry().contains(&id) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!runner.registry().contains(&id));
        assert!(runner.registry().listen(&id).is_err());
    }

    #[tokio::test]
    async fn test_cancellation_reaches_computation() {
        let runner = runner();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let id = runner.submit("test", move |ctx| -> Result<()> {
            started_tx.send(()).ok();
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        });

        let mut listener = runner.registry().listen(&id).unwrap();
        assert_eq!(
            listener.next().await,
            Some(ResultEvent::status("Starting computation..."))
        );
        tokio::task::spawn_blocking(move || started_rx.recv().ok())
            .await
            .unwrap();
        drop(listener);

        for _ in 0..400 {
            if !runner.registry().contains(&id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!runner.registry().contains(&id));
    }
}
