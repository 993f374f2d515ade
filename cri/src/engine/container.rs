//! Container state management.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use machined_core::error::{MachinedError, Result};

use crate::cri_api::{self, ContainerFilter, ContainerMetadata, ImageSpec, KeyValue, Mount};

/// Exit code recorded for a container killed without a grace period.
pub const EXIT_KILLED: i32 = 137;

/// Exit code recorded for a container stopped with a grace period.
pub const EXIT_TERMINATED: i32 = 143;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Exited,
}

impl ContainerState {
    pub fn to_cri(self) -> cri_api::ContainerState {
        match self {
            ContainerState::Created => cri_api::ContainerState::ContainerCreated,
            ContainerState::Running => cri_api::ContainerState::ContainerRunning,
            ContainerState::Exited => cri_api::ContainerState::ContainerExited,
        }
    }
}

/// A container within a pod sandbox.
#[derive(Debug, Clone)]
pub struct Container {
    /// Unique container identifier.
    pub id: String,
    /// Parent sandbox identifier.
    pub sandbox_id: String,
    /// Container name.
    pub name: String,
    pub attempt: u32,
    /// Image as requested by the kubelet.
    pub image: String,
    /// Resolved image ID, or the request itself when the image is unknown.
    pub image_ref: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub envs: Vec<KeyValue>,
    pub mounts: Vec<Mount>,
    /// Current state.
    pub state: ContainerState,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Start timestamp in nanoseconds (0 if not started).
    pub started_at: i64,
    /// Finish timestamp in nanoseconds (0 if not finished).
    pub finished_at: i64,
    /// Exit code (0 if not exited).
    pub exit_code: i32,
    /// Short reason for the last state change.
    pub reason: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Container annotations.
    pub annotations: HashMap<String, String>,
    /// Log file path.
    pub log_path: String,
}

impl Container {
    fn metadata(&self) -> ContainerMetadata {
        ContainerMetadata {
            name: self.name.clone(),
            attempt: self.attempt,
        }
    }

    fn image_spec(&self) -> ImageSpec {
        ImageSpec {
            image: self.image.clone(),
            annotations: Default::default(),
        }
    }

    pub fn to_cri(&self) -> cri_api::Container {
        cri_api::Container {
            id: self.id.clone(),
            pod_sandbox_id: self.sandbox_id.clone(),
            metadata: Some(self.metadata()),
            image: Some(self.image_spec()),
            image_ref: self.image_ref.clone(),
            state: self.state.to_cri().into(),
            created_at: self.created_at,
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    pub fn to_status(&self) -> cri_api::ContainerStatus {
        cri_api::ContainerStatus {
            id: self.id.clone(),
            metadata: Some(self.metadata()),
            state: self.state.to_cri().into(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            image: Some(self.image_spec()),
            image_ref: self.image_ref.clone(),
            reason: self.reason.clone(),
            message: String::new(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            mounts: self.mounts.clone(),
            log_path: self.log_path.clone(),
        }
    }

    /// Whether the container passes every criterion set in `filter`.
    pub fn matches(&self, filter: &ContainerFilter) -> bool {
        if !filter.id.is_empty() && self.id != filter.id {
            return false;
        }
        if !filter.pod_sandbox_id.is_empty() && self.sandbox_id != filter.pod_sandbox_id {
            return false;
        }
        if let Some(ref state_val) = filter.state {
            if state_val.state != self.state.to_cri() as i32 {
                return false;
            }
        }
        filter
            .label_selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// In-memory store for containers.
pub struct ContainerStore {
    containers: Arc<RwLock<HashMap<String, Container>>>,
}

impl ContainerStore {
    /// Create a new empty container store.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a container to the store.
    pub async fn add(&self, container: Container) {
        let mut store = self.containers.write().await;
        store.insert(container.id.clone(), container);
    }

    /// Get a container by ID.
    pub async fn get(&self, id: &str) -> Option<Container> {
        let store = self.containers.read().await;
        store.get(id).cloned()
    }

    /// Remove a container by ID.
    pub async fn remove(&self, id: &str) -> Option<Container> {
        let mut store = self.containers.write().await;
        store.remove(id)
    }

    /// List containers matching `filter`, oldest first.
    pub async fn list(&self, filter: Option<&ContainerFilter>) -> Vec<Container> {
        let store = self.containers.read().await;
        let mut containers: Vec<Container> = store
            .values()
            .filter(|c| filter.map_or(true, |f| c.matches(f)))
            .cloned()
            .collect();
        containers.sort_by_key(|c| c.created_at);
        containers
    }

    /// Move a created container to running.
    pub async fn mark_started(&self, id: &str, started_at: i64) -> Result<()> {
        let mut store = self.containers.write().await;
        let c = store
            .get_mut(id)
            .ok_or_else(|| MachinedError::NotFound(format!("container {}", id)))?;
        if c.state != ContainerState::Created {
            return Err(MachinedError::FailedPrecondition(format!(
                "container {} is {:?}, not Created",
                id, c.state
            )));
        }
        c.state = ContainerState::Running;
        c.started_at = started_at;
        c.reason = "Started".to_string();
        Ok(())
    }

    /// Record an exit. Returns `false` if the container is unknown or had
    /// already exited.
    pub async fn mark_exited(&self, id: &str, finished_at: i64, exit_code: i32) -> bool {
        let mut store = self.containers.write().await;
        match store.get_mut(id) {
            Some(c) if c.state != ContainerState::Exited => {
                exit(c, finished_at, exit_code);
                true
            }
            _ => false,
        }
    }

    /// Exit every live container of a sandbox, returning how many changed.
    pub async fn exit_by_sandbox(&self, sandbox_id: &str, finished_at: i64, exit_code: i32) -> usize {
        let mut store = self.containers.write().await;
        let mut exited = 0;
        for c in store.values_mut() {
            if c.sandbox_id == sandbox_id && c.state != ContainerState::Exited {
                exit(c, finished_at, exit_code);
                exited += 1;
            }
        }
        exited
    }

    /// Remove all containers belonging to a sandbox.
    pub async fn remove_by_sandbox(&self, sandbox_id: &str) -> Vec<Container> {
        let mut store = self.containers.write().await;
        let ids: Vec<String> = store
            .values()
            .filter(|c| c.sandbox_id == sandbox_id)
            .map(|c| c.id.clone())
            .collect();

        ids.iter().filter_map(|id| store.remove(id)).collect()
    }
}

fn exit(c: &mut Container, finished_at: i64, exit_code: i32) {
    c.state = ContainerState::Exited;
    c.finished_at = finished_at;
    c.exit_code = exit_code;
    c.reason = if exit_code == 0 { "Completed" } else { "Error" }.to_string();
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}
