//! Job table: the only place job ids are minted
//!
//! Each slot holds the consumer half of the job's stream until a listener
//! claims it, plus the job's cancellation token. A slot is removed exactly
//! once, when the producer has finished *and* the stream has been claimed
//! (or, for streams nobody ever claims, when the reaper expires them).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::stream::{channel, EventSender, ResultEvent, ResultStream};
use crate::error::PatchError;

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PatchError::JobNotFound(s.to_string()))
    }
}

/// Producer-side handle returned by [`JobRegistry::create`]
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    pub sender: EventSender,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct JobSlot {
    stream: Option<ResultStream>,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobSlot>>,
    stream_capacity: usize,
}

impl JobRegistry {
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            stream_capacity,
        }
    }

    /// Mint a fresh id and register its stream
    pub fn create(&self) -> JobHandle {
        let (sender, stream) = channel(self.stream_capacity);
        let cancel = CancellationToken::new();
        let mut jobs = self.lock();

        let mut id = JobId(Uuid::new_v4());
        while jobs.contains_key(&id) {
            id = JobId(Uuid::new_v4());
        }
        jobs.insert(
            id,
            JobSlot {
                stream: Some(stream),
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        debug!("Created job {} ({} active)", id, jobs.len());

        JobHandle { id, sender, cancel }
    }

    /// Claim the stream of `id`
    ///
    /// Unknown ids and streams that already have a listener both fail
    /// with [`PatchError::JobNotFound`].
    pub fn listen(&self, id: &JobId) -> Result<JobListener, PatchError> {
        let mut jobs = self.lock();
        let slot = jobs
            .get_mut(id)
            .ok_or_else(|| PatchError::JobNotFound(id.to_string()))?;
        let stream = slot
            .stream
            .take()
            .ok_or_else(|| PatchError::JobNotFound(id.to_string()))?;
        let cancel = slot.cancel.clone();
        if slot.finished_at.is_some() {
            jobs.remove(id);
            debug!("Retired job {} on claim", id);
        }

        Ok(JobListener {
            id: *id,
            stream,
            cancel,
            completed: false,
        })
    }

    /// Mark the producer of `id` as finished
    pub fn retire(&self, id: &JobId) {
        let mut jobs = self.lock();
        let Some(slot) = jobs.get_mut(id) else {
            return;
        };
        if slot.stream.is_none() {
            jobs.remove(id);
            debug!("Retired job {}", id);
        } else {
            slot.finished_at = Some(Instant::now());
        }
    }

    /// Drop finished jobs whose stream was never claimed within `max_age`
    pub fn reap_abandoned(&self, max_age: Duration) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, slot| match slot.finished_at {
            Some(at) if slot.stream.is_some() => at.elapsed() < max_age,
            _ => true,
        });
        let reaped = before - jobs.len();
        if reaped > 0 {
            info!("Reaped {} unclaimed job(s)", reaped);
        }
        reaped
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobSlot>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer-side handle; dropping it before `complete` cancels the job
#[derive(Debug)]
pub struct JobListener {
    id: JobId,
    stream: ResultStream,
    cancel: CancellationToken,
    completed: bool,
}

impl JobListener {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn next(&mut self) -> Option<ResultEvent> {
        let event = self.stream.next().await;
        if event.as_ref().map_or(true, ResultEvent::is_complete) {
            self.completed = true;
        }
        event
    }

    /// Drain everything up to and including `complete`
    pub async fn collect(mut self) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = ResultEvent> + Send {
        stream! {
            let mut listener = self;
            while let Some(event) = listener.next().await {
                yield event;
            }
        }
    }
}

impl Drop for JobListener {
    fn drop(&mut self) {
        if !self.completed {
            info!("Listener for job {} disconnected, cancelling", self.id);
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let registry = JobRegistry::new(8);
        let ids: std::collections::HashSet<JobId> = (0..100).map(|_| registry.create().id).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_unknown_id_not_found() {
        let registry = JobRegistry::new(8);
        let other = JobRegistry::new(8).create().id;
        assert!(matches!(
            registry.listen(&other),
            Err(PatchError::JobNotFound(_))
        ));
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_stream_has_a_single_consumer() {
        let registry = JobRegistry::new(8);
        let handle = registry.create();
        let _first = registry.listen(&handle.id).unwrap();
        assert!(registry.listen(&handle.id).is_err());
    }

    #[tokio::test]
    async fn test_retire_after_claim_removes_slot() {
        let registry = JobRegistry::new(8);
        let handle = registry.create();
        let listener = registry.listen(&handle.id).unwrap();
        assert!(registry.contains(&handle.id));

        handle.sender.send(ResultEvent::Complete).await;
        registry.retire(&handle.id);
        assert!(!registry.contains(&handle.id));
        assert_eq!(listener.collect().await, vec![ResultEvent::Complete]);
    }

    #[tokio::test]
    async fn test_finished_job_stays_claimable_until_listened() {
        let registry = JobRegistry::new(8);
        let handle = registry.create();
        handle.sender.send(ResultEvent::status("Starting computation...")).await;
        handle.sender.send(ResultEvent::Complete).await;
        registry.retire(&handle.id);
        assert!(registry.contains(&handle.id));

        let events = registry.listen(&handle.id).unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(!registry.contains(&handle.id));
    }

    #[test]
    fn test_dropping_listener_early_cancels() {
        let registry = JobRegistry::new(8);
        let handle = registry.create();
        let listener = registry.listen(&handle.id).unwrap();
        assert!(!handle.cancel.is_cancelled());
        drop(listener);
        assert!(handle.cancel.is_cancelled());
    }

    #[test]
    fn test_reap_only_unclaimed_finished_jobs() {
        let registry = JobRegistry::new(8);
        let finished = registry.create();
        let running = registry.create();
        registry.retire(&finished.id);

        assert_eq!(registry.reap_abandoned(Duration::from_secs(3600)), 0);
        assert_eq!(registry.reap_abandoned(Duration::ZERO), 1);
        assert!(!registry.contains(&finished.id));
        assert!(registry.contains(&running.id));
    }
}
