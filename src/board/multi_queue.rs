use std::collections::HashSet;
use std::sync::Arc;

use crate::board::base::{BoardCore, QueueFn};
use crate::board::iterator::{IterStep, JobBoardIterator};
use crate::board::job::{Job, JobState};
use crate::error::Result;

/// Iterates one physical board as many virtual queues.
///
/// With `only_unclaimed` set, each pass yields at most one job per queue:
/// the queue's head-of-line job, and only while it is unclaimed. A claimed
/// head blocks the rest of its queue for the pass, which keeps jobs within a
/// queue strictly sequential while queues progress independently.
///
/// Without `only_unclaimed` every job is yielded and queue grouping is not
/// applied; listings use this as a full audit view.
pub struct MultiQueueIterator {
    inner: JobBoardIterator,
    queue_fn: QueueFn,
    seen_queues: HashSet<String>,
    only_unclaimed: bool,
}

impl MultiQueueIterator {
    pub fn new(core: Arc<BoardCore>, only_unclaimed: bool, ensure_fresh: bool) -> Self {
        let queue_fn = core.queue_fn();
        // The inner pass must see claimed jobs too: a claimed head still
        // occupies its queue.
        let inner = JobBoardIterator::new(core, false, ensure_fresh);
        Self {
            inner,
            queue_fn,
            seen_queues: HashSet::new(),
            only_unclaimed,
        }
    }

    pub async fn next(&mut self) -> Result<IterStep> {
        if !self.only_unclaimed {
            return self.inner.next().await;
        }

        loop {
            let Some((candidate, state)) = self.inner.next_with_state().await? else {
                return Ok(IterStep::Exhausted);
            };
            // A head whose state is unknown still blocks its queue.
            let queue = (self.queue_fn)(&candidate);
            if self.seen_queues.insert(queue) && state == Some(JobState::Unclaimed) {
                return Ok(IterStep::HasNext(candidate));
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        while let IterStep::HasNext(job) = self.next().await? {
            jobs.push(job);
        }
        Ok(jobs)
    }
}
