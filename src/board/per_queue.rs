use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::board::base::{detail_queue_fn, BoardCore, Layout};
use crate::board::job::{BookRef, Job};
use crate::board::watch::{spawn_watch, ChildrenHandler, WatchScope};
use crate::board::Board;
use crate::config::BoardConfig;
use crate::coordination::{join_path, Coordinator};
use crate::error::{BoardError, Result};

/// Watchers for every queue subtree currently under the board root, keyed by
/// queue name.
struct QueueRegistry {
    core: Arc<BoardCore>,
    scope: Arc<WatchScope>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl QueueRegistry {
    fn watchers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a watch to each listed queue lacking a live one and drop the
    /// watches of queues that disappeared. Safe to call repeatedly.
    async fn sync(&self, queues: &[String]) {
        let listed: BTreeSet<&str> = queues.iter().map(String::as_str).collect();

        let unlisted: Vec<String> = {
            let mut watchers = self.watchers();
            for queue in queues {
                let live = watchers
                    .get(queue)
                    .is_some_and(|handle| !handle.is_finished());
                if live {
                    continue;
                }
                let path = join_path(self.core.root(), queue);
                tracing::info!(board = %self.core.name(), queue = %queue, "Watching queue");
                let handle = spawn_watch(
                    self.core.coordinator(),
                    Arc::clone(&self.core),
                    path,
                    self.scope.token(),
                );
                watchers.insert(queue.clone(), handle);
            }

            watchers
                .keys()
                .filter(|queue| !listed.contains(queue.as_str()))
                .cloned()
                .collect()
        };

        // An outdated root listing may miss a queue a local post just created.
        let coordinator = self.core.coordinator();
        for queue in unlisted {
            let path = join_path(self.core.root(), &queue);
            match coordinator.exists(&path).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Failed to confirm queue removal");
                    continue;
                }
            }
            if let Some(handle) = self.watchers().remove(&queue) {
                handle.abort();
            }
            tracing::info!(board = %self.core.name(), queue = %queue, "Queue removed");
            self.core.forget_subtree(&path).await;
        }
    }

    fn live_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .watchers()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues
    }

    fn abort_all(&self) {
        for (_, handle) in self.watchers().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChildrenHandler for QueueRegistry {
    async fn on_children(&self, _path: &str, children: &[String]) {
        self.sync(children).await;
    }

    async fn on_gone(&self, path: &str) {
        tracing::warn!(board = %self.core.name(), root = path, "Board root removed");
        self.sync(&[]).await;
    }
}

/// Board giving each queue its own subtree (`<root>/<queue>/job…`).
///
/// The root is watched for new queue subtrees; each one found gets its own
/// children watch, so queues created after `connect` are picked up without a
/// restart. After a session loss the root listing that follows the restored
/// session re-syncs the registry, re-attaching any watch that ended.
pub struct PerQueueBoard {
    core: Arc<BoardCore>,
    queue_key: String,
    registry: Arc<QueueRegistry>,
    scope: Arc<WatchScope>,
    root_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PerQueueBoard {
    pub fn new(config: &BoardConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        let core = Arc::new(BoardCore::new(
            config,
            coordinator,
            Layout::PerQueue,
            detail_queue_fn(&config.queue_key),
        ));
        let scope = Arc::new(WatchScope::new());
        let registry = Arc::new(QueueRegistry {
            core: Arc::clone(&core),
            scope: Arc::clone(&scope),
            watchers: Mutex::new(HashMap::new()),
        });
        Self {
            core,
            queue_key: config.queue_key.clone(),
            registry,
            scope,
            root_watcher: Mutex::new(None),
        }
    }

    /// Queues with a live subtree watch.
    pub fn watched_queues(&self) -> Vec<String> {
        self.registry.live_queues()
    }

    /// Namespace path holding the jobs of `queue`.
    pub fn queue_path(&self, queue: &str) -> String {
        join_path(self.core.root(), queue)
    }

    fn root_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.root_watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Board for PerQueueBoard {
    fn core(&self) -> &Arc<BoardCore> {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        let coordinator = self.core.coordinator();
        coordinator.ensure_path(self.core.root()).await?;

        let mut slot = self.root_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        *slot = Some(spawn_watch(
            coordinator,
            Arc::clone(&self.registry),
            self.core.root().to_string(),
            self.scope.open(),
        ));
        tracing::info!(
            board = %self.core.name(),
            root = %self.core.root(),
            "Connected per-queue board"
        );
        Ok(())
    }

    async fn close(&self) {
        self.scope.close();
        if let Some(handle) = self.root_slot().take() {
            handle.abort();
        }
        self.registry.abort_all();
    }

    async fn post(
        &self,
        name: &str,
        book: Option<BookRef>,
        details: Map<String, Value>,
    ) -> Result<Job> {
        let queue = details
            .get(&self.queue_key)
            .and_then(Value::as_str)
            .ok_or_else(|| BoardError::PostingFailure {
                name: name.to_string(),
                reason: format!("missing queue key '{}'", self.queue_key),
            })?;
        if queue.is_empty() || queue.contains('/') {
            return Err(BoardError::PostingFailure {
                name: name.to_string(),
                reason: format!("invalid queue name '{}'", queue),
            });
        }

        let parent = self.queue_path(queue);
        self.core.post_at(&parent, name, book, details).await
    }
}
