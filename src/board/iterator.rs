use std::collections::VecDeque;
use std::sync::Arc;

use crate::board::base::BoardCore;
use crate::board::job::{Job, JobState};
use crate::error::Result;

/// One step of a board iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterStep {
    HasNext(Job),
    Exhausted,
}

impl IterStep {
    pub fn into_job(self) -> Option<Job> {
        match self {
            IterStep::HasNext(job) => Some(job),
            IterStep::Exhausted => None,
        }
    }
}

/// Single forward pass over the jobs a board knows about, lowest sequence
/// first. Jobs are fetched lazily on the first call to [`next`](Self::next);
/// a new iterator is needed to re-scan.
pub struct JobBoardIterator {
    core: Arc<BoardCore>,
    only_unclaimed: bool,
    ensure_fresh: bool,
    jobs: Option<VecDeque<Job>>,
}

impl JobBoardIterator {
    pub fn new(core: Arc<BoardCore>, only_unclaimed: bool, ensure_fresh: bool) -> Self {
        Self {
            core,
            only_unclaimed,
            ensure_fresh,
            jobs: None,
        }
    }

    pub async fn next(&mut self) -> Result<IterStep> {
        loop {
            match self.next_with_state().await? {
                Some((job, Some(_))) => return Ok(IterStep::HasNext(job)),
                // Unreadable jobs are left out of a plain pass.
                Some((_, None)) => {}
                None => return Ok(IterStep::Exhausted),
            }
        }
    }

    /// Next job together with the state it was observed in; `None` when the
    /// state could not be read.
    pub(crate) async fn next_with_state(&mut self) -> Result<Option<(Job, Option<JobState>)>> {
        if self.jobs.is_none() {
            let fetched = self.core.fetch_jobs(self.ensure_fresh).await?;
            self.jobs = Some(VecDeque::from(fetched));
        }

        while let Some(job) = self.jobs.as_mut().and_then(VecDeque::pop_front) {
            match self.core.state(&job).await {
                Ok(JobState::Complete) => self.core.remove_job(job.path()).await,
                Ok(state) if self.only_unclaimed && state != JobState::Unclaimed => {}
                Ok(state) => return Ok(Some((job, Some(state)))),
                Err(e) => {
                    tracing::warn!(
                        job = %job.path(),
                        error = %e,
                        "Failed determining the state of job"
                    );
                    return Ok(Some((job, None)));
                }
            }
        }
        Ok(None)
    }

    /// Drain the remaining pass into a vector.
    pub async fn collect(mut self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        while let IterStep::HasNext(job) = self.next().await? {
            jobs.push(job);
        }
        Ok(jobs)
    }
}
