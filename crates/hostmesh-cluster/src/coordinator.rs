//! Coordinate storage collaborator
//!
//! A small hierarchical key-value store used to allocate host ids, publish
//! per-host metadata and wait for hosts to register. Paths are `/`-separated
//! and have no leading slash.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use hostmesh_core::types::HostId;

/// Parent of the sequential host id nodes
pub const HOST_IDS_PATH: &str = "hostids";
/// Prefix of each sequential host id node
pub const HOST_ID_PREFIX: &str = "hostids/host";
/// Parent of the ephemeral per-host metadata nodes
pub const HOSTS_PATH: &str = "hosts";
/// Cluster instance identity, written once by the leader
pub const INSTANCE_ID_PATH: &str = "instance_id";

/// Width of the suffix appended to sequential nodes
pub const SEQUENCE_DIGITS: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinateError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Coordinate store session lost")]
    SessionLost,
}

pub type CoordinateResult<T> = Result<T, CoordinateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Persistent with a zero-padded, monotonically increasing suffix
    PersistentSequential,
    /// Removed when its owner session expires
    Ephemeral { owner: i64 },
}

#[async_trait]
pub trait CoordinateStore: Send + Sync {
    /// Create a node, returning the actual path (with suffix for sequential nodes)
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinateResult<String>;

    async fn get_data(&self, path: &str) -> CoordinateResult<Vec<u8>>;

    async fn delete(&self, path: &str) -> CoordinateResult<()>;

    /// Child names (last path segment) in sorted order
    async fn get_children(&self, path: &str) -> CoordinateResult<Vec<String>>;

    /// A receiver that observes the child list of `path` whenever it changes
    async fn watch_children(&self, path: &str) -> CoordinateResult<watch::Receiver<Vec<String>>>;

    /// Drop every ephemeral node owned by `owner`
    async fn expire_owner(&self, owner: i64) -> CoordinateResult<()>;
}

/// Parse the host id encoded in a sequential `hostids/host<N>` path
pub fn host_id_from_path(path: &str) -> Option<HostId> {
    let suffix = path.strip_prefix(HOST_ID_PREFIX)?;
    if suffix.len() != SEQUENCE_DIGITS {
        return None;
    }
    suffix.parse().ok()
}

/// Metadata node published for each live host under [`HOSTS_PATH`]
pub fn host_metadata_path(host_id: HostId) -> String {
    format!("{}/host{}", HOSTS_PATH, host_id)
}

/// Metadata published for a live host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetadata {
    pub address: String,
    pub port: u16,
    pub host_display_name: String,
    pub group: String,
    pub sites_per_host: u32,
}

/// Cluster identity written by the leader at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId {
    pub coord: String,
    pub timestamp: i64,
}

struct Node {
    data: Vec<u8>,
    owner: Option<i64>,
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    watchers: HashMap<String, watch::Sender<Vec<String>>>,
}

impl StoreState {
    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent);
        self.nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn notify(&self, path: &str) {
        let parent = parent_of(path);
        if let Some(tx) = self.watchers.get(parent) {
            tx.send_replace(self.children(parent));
        }
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn validate(path: &str) -> CoordinateResult<()> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(CoordinateError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Process-local coordinate store. Parent nodes are implicit.
#[derive(Default)]
pub struct InMemoryCoordinateStore {
    state: Mutex<StoreState>,
}

impl InMemoryCoordinateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinateStore for InMemoryCoordinateStore {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinateResult<String> {
        validate(path)?;
        let mut state = self.state.lock();

        let actual = match mode {
            CreateMode::PersistentSequential => {
                let next = state.sequences.entry(path.to_string()).or_insert(0);
                let actual = format!("{}{:0width$}", path, *next, width = SEQUENCE_DIGITS);
                *next += 1;
                actual
            }
            CreateMode::Persistent | CreateMode::Ephemeral { .. } => path.to_string(),
        };

        if state.nodes.contains_key(&actual) {
            return Err(CoordinateError::NodeExists(actual));
        }

        let owner = match mode {
            CreateMode::Ephemeral { owner } => Some(owner),
            _ => None,
        };
        state.nodes.insert(actual.clone(), Node { data, owner });
        state.notify(&actual);
        Ok(actual)
    }

    async fn get_data(&self, path: &str) -> CoordinateResult<Vec<u8>> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinateError::NoNode(path.to_string()))
    }

    async fn delete(&self, path: &str) -> CoordinateResult<()> {
        let mut state = self.state.lock();
        if state.nodes.remove(path).is_none() {
            return Err(CoordinateError::NoNode(path.to_string()));
        }
        state.notify(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> CoordinateResult<Vec<String>> {
        Ok(self.state.lock().children(path))
    }

    async fn watch_children(&self, path: &str) -> CoordinateResult<watch::Receiver<Vec<String>>> {
        let mut state = self.state.lock();
        let children = state.children(path);
        let rx = match state.watchers.get(path) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(children);
                state.watchers.insert(path.to_string(), tx);
                rx
            }
        };
        Ok(rx)
    }

    async fn expire_owner(&self, owner: i64) -> CoordinateResult<()> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(owner))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &expired {
            state.nodes.remove(path);
        }
        for path in &expired {
            state.notify(path);
        }
        Ok(())
    }
}
