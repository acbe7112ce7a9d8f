use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::board::base::{detail_queue_fn, BoardCore, Layout, QueueFn};
use crate::board::job::{BookRef, Job};
use crate::board::watch::{spawn_watch, WatchScope};
use crate::board::Board;
use crate::config::BoardConfig;
use crate::coordination::Coordinator;
use crate::error::Result;

/// Board keeping every job directly under its root; queues exist only
/// through the queue function.
pub struct FlatBoard {
    core: Arc<BoardCore>,
    scope: WatchScope,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FlatBoard {
    pub fn new(config: &BoardConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self::with_queue_fn(config, coordinator, detail_queue_fn(&config.queue_key))
    }

    pub fn with_queue_fn(
        config: &BoardConfig,
        coordinator: Arc<dyn Coordinator>,
        queue_fn: QueueFn,
    ) -> Self {
        Self {
            core: Arc::new(BoardCore::new(config, coordinator, Layout::Flat, queue_fn)),
            scope: WatchScope::new(),
            watcher: Mutex::new(None),
        }
    }

    fn watcher_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Board for FlatBoard {
    fn core(&self) -> &Arc<BoardCore> {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        let coordinator = self.core.coordinator();
        coordinator.ensure_path(self.core.root()).await?;

        let mut slot = self.watcher_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        *slot = Some(spawn_watch(
            coordinator,
            Arc::clone(&self.core),
            self.core.root().to_string(),
            self.scope.open(),
        ));
        tracing::info!(board = %self.core.name(), root = %self.core.root(), "Connected flat board");
        Ok(())
    }

    async fn close(&self) {
        self.scope.close();
        if let Some(handle) = self.watcher_slot().take() {
            handle.abort();
        }
    }

    async fn post(
        &self,
        name: &str,
        book: Option<BookRef>,
        details: Map<String, Value>,
    ) -> Result<Job> {
        self.core.post_at(self.core.root(), name, book, details).await
    }
}
