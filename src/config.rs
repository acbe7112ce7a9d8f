use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConductorError;

/// Default pause between conductor passes, in seconds.
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 0.5;
pub const DEFAULT_MAX_WORKERS: usize = 100;
pub const DEFAULT_BOARD_PATH: &str = "/jobboard";
pub const DEFAULT_QUEUE_KEY: &str = "app";

/// Configuration for sandboxed step execution.
///
/// When enabled, every flow step runs in its own Docker container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run steps through `docker run` instead of a plain `sh -c`
    pub enabled: bool,
    /// Docker image to use for step execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BoardKind {
    /// All jobs under the board root, grouped by the queue key
    Flat,
    /// One namespace subtree per queue
    PerQueue,
}

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub name: String,
    /// Root path of the board in the coordination namespace
    pub path: String,
    /// Detail key naming the queue a job belongs to
    pub queue_key: String,
    pub kind: BoardKind,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: "board".to_string(),
            path: DEFAULT_BOARD_PATH.to_string(),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            kind: BoardKind::PerQueue,
        }
    }
}

impl BoardConfig {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_queue_key(mut self, key: &str) -> Self {
        self.queue_key = key.to_string();
        self
    }

    pub fn with_kind(mut self, kind: BoardKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Pause between conductor passes, as given by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitTimeout {
    Seconds(f64),
    /// `"0.5"`, `"250ms"` or `"2s"`
    Literal(String),
    Duration(Duration),
}

impl Default for WaitTimeout {
    fn default() -> Self {
        WaitTimeout::Seconds(DEFAULT_WAIT_TIMEOUT_SECS)
    }
}

impl WaitTimeout {
    pub fn resolve(&self) -> Result<Duration, ConductorError> {
        match self {
            WaitTimeout::Duration(d) => Ok(*d),
            WaitTimeout::Seconds(secs) => seconds(*secs, &secs.to_string()),
            WaitTimeout::Literal(raw) => parse_timeout_literal(raw),
        }
    }
}

fn seconds(secs: f64, raw: &str) -> Result<Duration, ConductorError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConductorError::InvalidTimeout(raw.to_string()))
}

pub fn parse_timeout_literal(raw: &str) -> Result<Duration, ConductorError> {
    let trimmed = raw.trim();
    let invalid = || ConductorError::InvalidTimeout(raw.to_string());

    if let Some(millis) = trimmed.strip_suffix("ms") {
        let millis: f64 = millis.trim().parse().map_err(|_| invalid())?;
        return seconds(millis / 1000.0, raw);
    }
    let secs = trimmed.strip_suffix('s').unwrap_or(trimmed);
    let secs: f64 = secs.trim().parse().map_err(|_| invalid())?;
    seconds(secs, raw)
}

#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Owner name recorded on every claim
    pub name: String,
    pub wait_timeout: WaitTimeout,
    /// Upper bound on concurrently running executions
    pub max_workers: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            name: "conductor".to_string(),
            wait_timeout: WaitTimeout::default(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl ConductorConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_wait_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub board: BoardConfig,
    pub conductor: ConductorConfig,
    pub sandbox: SandboxConfig,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            board: BoardConfig::default(),
            conductor: ConductorConfig::default(),
            sandbox: SandboxConfig::default(),
            dashboard_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
        }
    }
}
