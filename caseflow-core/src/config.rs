//! Coordinator configuration.
//!
//! Built with `Default` + setters, or read from `CASEFLOW_*` environment
//! variables. Unparseable values fall back to the default with a warning.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Configuration for the case workflow coordinator and its server.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseflowConfig {
    /// Listen address for the HTTP surface.
    pub bind_addr: String,

    /// Postgres connection string. `None` runs on the in-memory store.
    pub database_url: Option<String>,

    /// Pool size when running against Postgres.
    pub db_max_connections: u32,

    /// Broadcast capacity of the notification fan-out.
    ///
    /// A session that falls further behind than this resyncs.
    pub fanout_capacity: usize,

    /// Out-of-order events held per case before a projector gives up and resyncs.
    pub reorder_limit: usize,

    /// Window within which bursts of change events are coalesced.
    pub queue_debounce: Duration,

    /// Directory for locally stored radiographs, if any.
    pub artifact_root: Option<PathBuf>,
}

impl Default for CaseflowConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".into(),
            database_url: None,
            db_max_connections: 10,
            fanout_capacity: 1024,
            reorder_limit: 32,
            queue_debounce: Duration::from_millis(300),
            artifact_root: None,
        }
    }
}

impl CaseflowConfig {
    /// Read `CASEFLOW_*` variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CaseflowConfig::from_env`] over an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            bind_addr: non_empty("CASEFLOW_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: non_empty("CASEFLOW_DATABASE_URL"),
            db_max_connections: parsed(&lookup, "CASEFLOW_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.db_max_connections),
            fanout_capacity: parsed(&lookup, "CASEFLOW_FANOUT_CAPACITY")
                .unwrap_or(defaults.fanout_capacity),
            reorder_limit: parsed(&lookup, "CASEFLOW_REORDER_LIMIT")
                .unwrap_or(defaults.reorder_limit),
            queue_debounce: parsed(&lookup, "CASEFLOW_QUEUE_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_debounce),
            artifact_root: non_empty("CASEFLOW_ARTIFACT_ROOT").map(PathBuf::from),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn fanout_capacity(mut self, capacity: usize) -> Self {
        self.fanout_capacity = capacity;
        self
    }

    pub fn reorder_limit(mut self, limit: usize) -> Self {
        self.reorder_limit = limit;
        self
    }

    pub fn queue_debounce(mut self, window: Duration) -> Self {
        self.queue_debounce = window;
        self
    }

    pub fn artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = Some(root.into());
        self
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
