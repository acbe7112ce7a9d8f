//! Job boards: postings in the coordination namespace, seen as virtual queues.
//!
//! - [`FlatBoard`]: every job directly under the board root, grouped into
//!   queues by a detail key
//! - [`PerQueueBoard`]: one namespace subtree per queue, discovered and
//!   watched at runtime
//!
//! Both share [`BoardCore`] for the cache and the claim/consume/abandon
//! transactions, and both iterate through [`MultiQueueIterator`].

pub mod base;
pub mod flat;
pub mod iterator;
pub mod job;
pub mod multi_queue;
pub mod per_queue;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

pub use base::{detail_queue_fn, BoardCore, BoardEvent, Layout, QueueFn};
pub use flat::FlatBoard;
pub use iterator::{IterStep, JobBoardIterator};
pub use job::{BookRef, Job, JobPosting, JobState};
pub use multi_queue::MultiQueueIterator;
pub use per_queue::PerQueueBoard;

use crate::error::Result;

#[async_trait]
pub trait Board: Send + Sync {
    fn core(&self) -> &Arc<BoardCore>;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Ensure the board root exists and start watching it.
    async fn connect(&self) -> Result<()>;

    /// Stop all watches. Claims held through this board are unaffected.
    async fn close(&self);

    async fn post(
        &self,
        name: &str,
        book: Option<BookRef>,
        details: Map<String, Value>,
    ) -> Result<Job>;

    async fn claim(&self, job: &Job, who: &str) -> Result<()> {
        self.core().claim(job, who).await
    }

    async fn consume(&self, job: &Job, who: &str) -> Result<()> {
        self.core().consume(job, who).await
    }

    async fn abandon(&self, job: &Job, who: &str) -> Result<()> {
        self.core().abandon(job, who).await
    }

    async fn state(&self, job: &Job) -> Result<JobState> {
        self.core().state(job).await
    }

    async fn owner(&self, job: &Job) -> Result<Option<String>> {
        self.core().owner(job).await
    }

    fn iterjobs(&self, only_unclaimed: bool, ensure_fresh: bool) -> MultiQueueIterator {
        MultiQueueIterator::new(Arc::clone(self.core()), only_unclaimed, ensure_fresh)
    }

    fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.core().subscribe()
    }

    /// Block until at least one job is known; false if `timeout` elapsed first.
    async fn wait(&self, timeout: Option<Duration>) -> bool {
        self.core().wait_for_jobs(timeout).await
    }

    async fn job_count(&self) -> usize {
        self.core().job_count().await
    }
}
