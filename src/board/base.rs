use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::Instant;

use crate::board::job::{
    is_job_node, parse_sequence, BookRef, Job, JobPosting, JobState, LockData, JOB_PREFIX,
};
use crate::board::watch::ChildrenHandler;
use crate::config::BoardConfig;
use crate::coordination::{join_path, split_path, CoordinationError, Coordinator, CreateMode, Op};
use crate::error::{BoardError, Result};

const EVENT_CAPACITY: usize = 256;

/// Maps a job to the virtual queue it belongs to.
pub type QueueFn = Arc<dyn Fn(&Job) -> String + Send + Sync>;

/// Queue function reading a string detail; jobs lacking it share the
/// unnamed queue `""`.
pub fn detail_queue_fn(key: &str) -> QueueFn {
    let key = key.to_string();
    Arc::new(move |job: &Job| job.detail_str(&key).unwrap_or_default().to_string())
}

/// Raw change notifications emitted by a board.
#[derive(Debug, Clone)]
pub enum BoardEvent {
    Posted(Job),
    Removed(Job),
}

/// Where job nodes live relative to the board root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Jobs are direct children of the root.
    Flat,
    /// Jobs live one level down, in a subtree per queue.
    PerQueue,
}

/// State and coordination logic shared by every board variant.
///
/// The cache of known jobs is only a view: every claim, consume and abandon
/// is validated against the coordination service as a conditional
/// transaction.
pub struct BoardCore {
    name: String,
    root: String,
    layout: Layout,
    coordinator: Arc<dyn Coordinator>,
    queue_fn: QueueFn,
    known: RwLock<BTreeMap<String, Job>>,
    job_cond: Notify,
    events: broadcast::Sender<BoardEvent>,
}

impl BoardCore {
    pub fn new(
        config: &BoardConfig,
        coordinator: Arc<dyn Coordinator>,
        layout: Layout,
        queue_fn: QueueFn,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: config.name.clone(),
            root: config.path.clone(),
            layout,
            coordinator,
            queue_fn,
            known: RwLock::new(BTreeMap::new()),
            job_cond: Notify::new(),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn coordinator(&self) -> Arc<dyn Coordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn queue_fn(&self) -> QueueFn {
        Arc::clone(&self.queue_fn)
    }

    pub fn queue_of(&self, job: &Job) -> String {
        (self.queue_fn)(job)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub async fn job_count(&self) -> usize {
        self.known.read().await.len()
    }

    /// Create a sequential job node under `parent` and record it locally.
    pub async fn post_at(
        &self,
        parent: &str,
        name: &str,
        book: Option<BookRef>,
        details: Map<String, Value>,
    ) -> Result<Job> {
        let posting = JobPosting::new(name, book, details);
        let data = serde_json::to_vec(&posting)?;
        let prefix = join_path(parent, JOB_PREFIX);

        let created = self
            .coordinator
            .create(&prefix, data, CreateMode::PersistentSequential, true)
            .await
            .map_err(|e| BoardError::PostingFailure {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let sequence = split_path(&created)
            .and_then(|(_, node)| parse_sequence(node))
            .ok_or_else(|| BoardError::PostingFailure {
                name: name.to_string(),
                reason: format!("unexpected node name {}", created),
            })?;

        let job = Job::new(created, sequence, posting);
        // The watch may already have discovered the node.
        let fresh = self
            .known
            .write()
            .await
            .insert(job.path().to_string(), job.clone())
            .is_none();
        if fresh {
            self.job_cond.notify_waiters();
            let _ = self.events.send(BoardEvent::Posted(job.clone()));
        }

        tracing::info!(board = %self.name, job = %job.path(), sequence, "Posted job");
        Ok(job)
    }

    pub async fn claim(&self, job: &Job, who: &str) -> Result<()> {
        let lock = serde_json::to_vec(&LockData {
            owner: who.to_string(),
        })?;
        let ops = vec![
            Op::Check {
                path: job.path().to_string(),
                version: None,
            },
            Op::Create {
                path: job.lock_path(),
                data: lock,
                mode: CreateMode::Ephemeral,
            },
        ];

        match self.coordinator.multi(ops).await {
            Ok(()) => {
                tracing::debug!(job = %job.path(), owner = who, "Claimed job");
                Ok(())
            }
            Err(CoordinationError::NoNode(_)) => {
                Err(BoardError::JobNotFound(job.path().to_string()))
            }
            Err(CoordinationError::NodeExists(_)) => match self.owner(job).await? {
                Some(owner) if owner == who => Ok(()),
                Some(owner) => Err(BoardError::UnclaimableJob {
                    path: job.path().to_string(),
                    owner,
                }),
                None => Err(BoardError::UnclaimableJob {
                    path: job.path().to_string(),
                    owner: "<released>".to_string(),
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn consume(&self, job: &Job, who: &str) -> Result<()> {
        let version = self.verify_owner(job, who).await?;
        let ops = vec![
            Op::Check {
                path: job.lock_path(),
                version: Some(version),
            },
            Op::Delete {
                path: job.lock_path(),
                version: Some(version),
            },
            Op::Delete {
                path: job.path().to_string(),
                version: None,
            },
        ];
        self.coordinator
            .multi(ops)
            .await
            .map_err(|e| self.resolve_error(job, who, e))?;

        self.remove_job(job.path()).await;
        tracing::info!(job = %job.path(), owner = who, "Consumed job");
        Ok(())
    }

    pub async fn abandon(&self, job: &Job, who: &str) -> Result<()> {
        let version = self.verify_owner(job, who).await?;
        let ops = vec![
            Op::Check {
                path: job.lock_path(),
                version: Some(version),
            },
            Op::Delete {
                path: job.lock_path(),
                version: Some(version),
            },
        ];
        self.coordinator
            .multi(ops)
            .await
            .map_err(|e| self.resolve_error(job, who, e))?;

        tracing::info!(job = %job.path(), owner = who, "Abandoned job");
        Ok(())
    }

    /// Live state read from the coordination service.
    pub async fn state(&self, job: &Job) -> Result<JobState> {
        if self.coordinator.exists(job.path()).await?.is_none() {
            return Ok(JobState::Complete);
        }
        match self.coordinator.exists(&job.lock_path()).await? {
            Some(_) => Ok(JobState::Claimed),
            None => Ok(JobState::Unclaimed),
        }
    }

    pub async fn owner(&self, job: &Job) -> Result<Option<String>> {
        match self.coordinator.get(&job.lock_path()).await {
            Ok((data, _)) => {
                let lock: LockData = serde_json::from_slice(&data)?;
                Ok(Some(lock.owner))
            }
            Err(CoordinationError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check `who` holds the claim and return the lock node's version.
    async fn verify_owner(&self, job: &Job, who: &str) -> Result<i32> {
        if self.coordinator.exists(job.path()).await?.is_none() {
            self.remove_job(job.path()).await;
            return Err(BoardError::JobNotFound(job.path().to_string()));
        }
        let (data, stat) = match self.coordinator.get(&job.lock_path()).await {
            Ok(found) => found,
            Err(CoordinationError::NoNode(_)) => {
                return Err(BoardError::NotClaimed(job.path().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let lock: LockData = serde_json::from_slice(&data)?;
        if lock.owner != who {
            return Err(BoardError::NotOwner {
                path: job.path().to_string(),
                owner: lock.owner,
                requester: who.to_string(),
            });
        }
        Ok(stat.version)
    }

    fn resolve_error(&self, job: &Job, who: &str, err: CoordinationError) -> BoardError {
        match err {
            CoordinationError::NoNode(path) if path == job.path() => {
                BoardError::JobNotFound(path)
            }
            CoordinationError::NoNode(_) => BoardError::NotClaimed(job.path().to_string()),
            CoordinationError::BadVersion { .. } => BoardError::NotOwner {
                path: job.path().to_string(),
                owner: "<changed>".to_string(),
                requester: who.to_string(),
            },
            other => other.into(),
        }
    }

    /// Known jobs ordered by sequence number, optionally re-listed from the
    /// coordination service first.
    pub async fn fetch_jobs(&self, ensure_fresh: bool) -> Result<Vec<Job>> {
        if ensure_fresh {
            self.refresh().await?;
        }
        let mut jobs: Vec<Job> = self.known.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.sequence()
                .cmp(&b.sequence())
                .then_with(|| a.path().cmp(b.path()))
        });
        Ok(jobs)
    }

    /// Paths whose children are job nodes.
    async fn job_parents(&self) -> Result<Vec<String>> {
        match self.layout {
            Layout::Flat => Ok(vec![self.root.clone()]),
            Layout::PerQueue => match self.coordinator.children(&self.root).await {
                Ok(queues) => Ok(queues
                    .iter()
                    .map(|queue| join_path(&self.root, queue))
                    .collect()),
                Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Re-list every job subtree, replacing whatever the watches reported.
    pub async fn refresh(&self) -> Result<()> {
        let parents = self.job_parents().await?;
        let wanted: BTreeSet<&str> = parents.iter().map(String::as_str).collect();

        let stale: Vec<String> = self
            .known
            .read()
            .await
            .keys()
            .filter(|path| {
                split_path(path)
                    .map(|(parent, _)| !wanted.contains(parent))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for path in stale {
            self.remove_if_gone(&path).await;
        }

        for parent in &parents {
            match self.coordinator.children(parent).await {
                Ok(children) => self.sync_children(parent, &children).await,
                Err(CoordinationError::NoNode(_)) => self.forget_subtree(parent).await,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Bring the cache for `parent` in line with its current children.
    pub async fn sync_children(&self, parent: &str, children: &[String]) {
        let present: BTreeSet<String> = children
            .iter()
            .filter(|name| is_job_node(name))
            .map(|name| join_path(parent, name))
            .collect();

        let (gone, missing) = {
            let known = self.known.read().await;
            let gone: Vec<String> = known
                .keys()
                .filter(|path| {
                    split_path(path).map(|(p, _)| p == parent).unwrap_or(false)
                        && !present.contains(*path)
                })
                .cloned()
                .collect();
            let missing: Vec<String> = present
                .iter()
                .filter(|path| !known.contains_key(*path))
                .cloned()
                .collect();
            (gone, missing)
        };

        for path in gone {
            self.remove_if_gone(&path).await;
        }

        let mut added = Vec::new();
        for path in missing {
            if let Some(job) = self.load_job(&path).await {
                added.push(job);
            }
        }
        if added.is_empty() {
            return;
        }

        // A local post may have recorded some of these in the meantime.
        let added: Vec<Job> = {
            let mut known = self.known.write().await;
            added
                .into_iter()
                .filter(|job| {
                    known
                        .insert(job.path().to_string(), job.clone())
                        .is_none()
                })
                .collect()
        };
        if added.is_empty() {
            return;
        }
        self.job_cond.notify_waiters();
        for job in added {
            tracing::debug!(board = %self.name, job = %job.path(), "Discovered job");
            let _ = self.events.send(BoardEvent::Posted(job));
        }
    }

    async fn load_job(&self, path: &str) -> Option<Job> {
        let sequence = split_path(path).and_then(|(_, name)| parse_sequence(name))?;
        match self.coordinator.get(path).await {
            Ok((data, _)) => match serde_json::from_slice::<JobPosting>(&data) {
                Ok(posting) => Some(Job::new(path.to_string(), sequence, posting)),
                Err(e) => {
                    tracing::warn!(job = path, error = %e, "Skipping job with unreadable posting");
                    None
                }
            },
            // Consumed between listing and reading.
            Err(CoordinationError::NoNode(_)) => None,
            Err(e) => {
                tracing::warn!(job = path, error = %e, "Failed to read job posting");
                None
            }
        }
    }

    /// Evict `path` only once the service confirms the node is gone.
    ///
    /// Listings can arrive after local posts that they predate, so a job
    /// missing from one is not proof that it was consumed.
    async fn remove_if_gone(&self, path: &str) {
        match self.coordinator.exists(path).await {
            Ok(None) => self.remove_job(path).await,
            Ok(Some(_)) => {
                tracing::debug!(board = %self.name, job = path, "Ignoring outdated listing");
            }
            Err(e) => {
                tracing::warn!(job = path, error = %e, "Failed to confirm job removal");
            }
        }
    }

    pub async fn remove_job(&self, path: &str) {
        let removed = self.known.write().await.remove(path);
        if let Some(job) = removed {
            self.job_cond.notify_waiters();
            let _ = self.events.send(BoardEvent::Removed(job));
        }
    }

    /// Drop every cached job under `parent`.
    pub async fn forget_subtree(&self, parent: &str) {
        let paths: Vec<String> = self
            .known
            .read()
            .await
            .keys()
            .filter(|path| split_path(path).map(|(p, _)| p == parent).unwrap_or(false))
            .cloned()
            .collect();
        for path in paths {
            self.remove_job(&path).await;
        }
    }

    /// Wait until at least one job is known. Returns false on timeout.
    pub async fn wait_for_jobs(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.job_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.known.read().await.is_empty() {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return !self.known.read().await.is_empty();
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait::async_trait]
impl ChildrenHandler for BoardCore {
    async fn on_children(&self, path: &str, children: &[String]) {
        self.sync_children(path, children).await;
    }

    async fn on_gone(&self, path: &str) {
        self.forget_subtree(path).await;
    }
}
