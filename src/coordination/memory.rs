use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{
    join_path, split_path, validate_path, ChildrenWatch, CoordinationError, CoordinationResult,
    Coordinator, CreateMode, Op, Stat, WatchEvent,
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            data,
            stat: Stat {
                version: 0,
                created_at: now,
                modified_at: now,
                ephemeral_owner,
                num_children: 0,
            },
            next_sequence: 0,
        }
    }
}

/// Paths whose children changed and paths that disappeared during a mutation.
#[derive(Debug, Default)]
struct Changes {
    children_changed: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: BTreeMap<String, Node>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self { nodes }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| {
            let mut stat = node.stat.clone();
            stat.num_children = self.children(path).len();
            stat
        })
    }

    fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
        session: u64,
        changes: &mut Changes,
    ) -> CoordinationResult<String> {
        validate_path(path)?;
        let (parent, _) =
            split_path(path).ok_or_else(|| CoordinationError::InvalidPath(path.to_string()))?;

        if !self.nodes.contains_key(parent) {
            if !make_parents {
                return Err(CoordinationError::NoNode(parent.to_string()));
            }
            self.ensure_path(parent, changes)?;
        }

        let created = if mode.is_sequential() {
            let parent_node = self
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordinationError::NoNode(parent.to_string()))?;
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&created) {
            return Err(CoordinationError::NodeExists(created));
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(created.clone(), Node::new(data, owner));
        changes.children_changed.insert(parent.to_string());
        Ok(created)
    }

    fn ensure_path(&mut self, path: &str, changes: &mut Changes) -> CoordinationResult<()> {
        validate_path(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let parent = if current.is_empty() {
                "/".to_string()
            } else {
                current.clone()
            };
            current = join_path(&parent, segment);
            if !self.nodes.contains_key(&current) {
                self.nodes
                    .insert(current.clone(), Node::new(Vec::new(), None));
                changes.children_changed.insert(parent);
            }
        }
        Ok(())
    }

    fn check_version(path: &str, node: &Node, version: Option<i32>) -> CoordinationResult<()> {
        match version {
            Some(expected) if expected != node.stat.version => Err(CoordinationError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.stat.version,
            }),
            _ => Ok(()),
        }
    }

    fn delete(
        &mut self,
        path: &str,
        version: Option<i32>,
        changes: &mut Changes,
    ) -> CoordinationResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Self::check_version(path, node, version)?;
        if !self.children(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        if let Some((parent, _)) = split_path(path) {
            changes.children_changed.insert(parent.to_string());
        }
        changes.deleted.insert(path.to_string());
        Ok(())
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> CoordinationResult<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Self::check_version(path, node, version)?;
        node.data = data;
        node.stat.version += 1;
        node.stat.modified_at = Utc::now();
        Ok(())
    }

    fn check(&self, path: &str, version: Option<i32>) -> CoordinationResult<()> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Self::check_version(path, node, version)
    }

    /// Remove every ephemeral node owned by `session`.
    fn drop_session(&mut self, session: u64, changes: &mut Changes) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            // Ephemeral nodes never have children here, so this cannot fail.
            let _ = self.delete(&path, None, changes);
        }
    }
}

#[derive(Debug)]
struct Watcher {
    path: String,
    client: u64,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug)]
struct Shared {
    tree: Tree,
    watchers: Vec<Watcher>,
}

impl Shared {
    /// Deliver fresh listings to affected watchers and drop watchers whose
    /// node is gone or whose receiver was dropped.
    fn notify(&mut self, changes: &Changes) {
        let tree = &self.tree;
        self.watchers.retain(|watcher| {
            if watcher.tx.is_closed() || changes.deleted.contains(&watcher.path) {
                return false;
            }
            if changes.children_changed.contains(&watcher.path) {
                return watcher
                    .tx
                    .send(WatchEvent::Children(tree.children(&watcher.path)))
                    .is_ok();
            }
            true
        });
    }
}

/// A shared in-process namespace. Every [`MemoryCoordinator`] obtained from
/// [`MemoryNamespace::connect`] is an independent client with its own session.
#[derive(Debug, Clone)]
pub struct MemoryNamespace {
    shared: Arc<Mutex<Shared>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                tree: Tree::new(),
                watchers: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new client session.
    pub fn connect(&self) -> MemoryCoordinator {
        let client = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client, session, "Opened coordination session");
        MemoryCoordinator {
            namespace: self.clone(),
            client,
            session: AtomicU64::new(session),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of nodes currently stored, root included.
    pub fn node_count(&self) -> usize {
        self.lock().tree.nodes.len()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panic while holding the lock cannot leave the tree half-mutated:
        // transactions are applied to a copy and swapped in.
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client handle onto a [`MemoryNamespace`].
#[derive(Debug)]
pub struct MemoryCoordinator {
    namespace: MemoryNamespace,
    client: u64,
    session: AtomicU64,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    pub fn namespace(&self) -> &MemoryNamespace {
        &self.namespace
    }

    /// Simulate the service expiring this client's session and the client
    /// reconnecting with a new one. Ephemeral nodes of the old session are
    /// removed; this client's watches observe `SessionLost`, then
    /// `SessionRestored` and a fresh listing.
    pub fn expire_session(&self) {
        let next = self.namespace.next_id.fetch_add(1, Ordering::Relaxed);
        let old = self.session.swap(next, Ordering::SeqCst);
        tracing::info!(client = self.client, old, new = next, "Coordination session expired");

        let mut shared = self.namespace.lock();
        let mut changes = Changes::default();
        shared.tree.drop_session(old, &mut changes);

        let client = self.client;
        let Shared { tree, watchers } = &mut *shared;
        watchers.retain(|watcher| {
            if watcher.client != client {
                return true;
            }
            if watcher.tx.send(WatchEvent::SessionLost).is_err() {
                return false;
            }
            if !tree.nodes.contains_key(&watcher.path) {
                return false;
            }
            watcher.tx.send(WatchEvent::SessionRestored).is_ok()
                && watcher
                    .tx
                    .send(WatchEvent::Children(tree.children(&watcher.path)))
                    .is_ok()
        });
        shared.notify(&changes);
    }

    /// Close the session for good, releasing its ephemeral nodes and watches.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.load(Ordering::SeqCst);
        let mut shared = self.namespace.lock();
        let mut changes = Changes::default();
        shared.tree.drop_session(session, &mut changes);
        let client = self.client;
        shared.watchers.retain(|watcher| watcher.client != client);
        shared.notify(&changes);
        tracing::debug!(client, session, "Closed coordination session");
    }

    fn ensure_open(&self) -> CoordinationResult<u64> {
        let session = self.session.load(Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            Err(CoordinationError::SessionExpired(session))
        } else {
            Ok(session)
        }
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> CoordinationResult<String> {
        let session = self.ensure_open()?;
        let mut shared = self.namespace.lock();
        let mut changes = Changes::default();
        let created = shared
            .tree
            .create(path, data, mode, make_parents, session, &mut changes)?;
        shared.notify(&changes);
        Ok(created)
    }

    async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        self.ensure_open()?;
        let mut shared = self.namespace.lock();
        let mut changes = Changes::default();
        shared.tree.ensure_path(path, &mut changes)?;
        shared.notify(&changes);
        Ok(())
    }

    async fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        self.ensure_open()?;
        let shared = self.namespace.lock();
        let data = shared
            .tree
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        let stat = shared
            .tree
            .stat(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Ok((data, stat))
    }

    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.ensure_open()?;
        Ok(self.namespace.lock().tree.stat(path))
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.ensure_open()?;
        let shared = self.namespace.lock();
        if !shared.tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(shared.tree.children(path))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordinationResult<()> {
        self.ensure_open()?;
        let mut shared = self.namespace.lock();
        let mut changes = Changes::default();
        shared.tree.delete(path, version, &mut changes)?;
        shared.notify(&changes);
        Ok(())
    }

    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()> {
        let session = self.ensure_open()?;
        let mut shared = self.namespace.lock();
        let mut staged = shared.tree.clone();
        let mut changes = Changes::default();

        for op in ops {
            match op {
                Op::Create { path, data, mode } => {
                    staged.create(&path, data, mode, false, session, &mut changes)?;
                }
                Op::Delete { path, version } => staged.delete(&path, version, &mut changes)?,
                Op::SetData {
                    path,
                    data,
                    version,
                } => staged.set_data(&path, data, version)?,
                Op::Check { path, version } => staged.check(&path, version)?,
            }
        }

        shared.tree = staged;
        shared.notify(&changes);
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> CoordinationResult<ChildrenWatch> {
        self.ensure_open()?;
        let mut shared = self.namespace.lock();
        if !shared.tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Delivery into a receiver we still hold cannot fail.
        let _ = tx.send(WatchEvent::Children(shared.tree.children(path)));
        shared.watchers.push(Watcher {
            path: path.to_string(),
            client: self.client,
            tx,
        });
        Ok(rx)
    }
}
