//! Asynchronous job orchestration
//!
//! - `registry`: job table, id minting, listener hand-off
//! - `stream`: bounded per-job event channel
//! - `runner`: background execution with guaranteed stream termination

pub mod registry;
pub mod runner;
pub mod stream;

pub use registry::{JobHandle, JobId, JobListener, JobRegistry};
pub use runner::{describe_failure, JobContext, JobRunner, Progress, Silent};
pub use stream::{channel, EventSender, ResultEvent, ResultStream};
