//! Pod sandbox state management.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cri_api::{self, PodSandboxFilter, PodSandboxMetadata, PodSandboxNetworkStatus};

/// Sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Sandbox is running and ready.
    Ready,
    /// Sandbox has been stopped.
    NotReady,
}

impl SandboxState {
    pub fn to_cri(self) -> cri_api::PodSandboxState {
        match self {
            SandboxState::Ready => cri_api::PodSandboxState::SandboxReady,
            SandboxState::NotReady => cri_api::PodSandboxState::SandboxNotready,
        }
    }
}

/// A pod sandbox known to the local engine.
#[derive(Debug, Clone)]
pub struct PodSandbox {
    /// Unique sandbox identifier.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod UID.
    pub uid: String,
    /// Creation attempt reported by the kubelet.
    pub attempt: u32,
    /// Current state.
    pub state: SandboxState,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    pub hostname: String,
    /// Pod labels.
    pub labels: HashMap<String, String>,
    /// Pod annotations.
    pub annotations: HashMap<String, String>,
    /// Log directory path.
    pub log_directory: String,
    /// Runtime handler name.
    pub runtime_handler: String,
}

impl PodSandbox {
    fn metadata(&self) -> PodSandboxMetadata {
        PodSandboxMetadata {
            name: self.name.clone(),
            uid: self.uid.clone(),
            namespace: self.namespace.clone(),
            attempt: self.attempt,
        }
    }

    pub fn to_cri(&self) -> cri_api::PodSandbox {
        cri_api::PodSandbox {
            id: self.id.clone(),
            metadata: Some(self.metadata()),
            state: self.state.to_cri().into(),
            created_at: self.created_at,
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }

    pub fn to_status(&self) -> cri_api::PodSandboxStatus {
        cri_api::PodSandboxStatus {
            id: self.id.clone(),
            metadata: Some(self.metadata()),
            state: self.state.to_cri().into(),
            created_at: self.created_at,
            network: Some(PodSandboxNetworkStatus {
                ip: String::new(),
                additional_ips: vec![],
            }),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }

    /// Whether the sandbox passes every criterion set in `filter`.
    pub fn matches(&self, filter: &PodSandboxFilter) -> bool {
        if !filter.id.is_empty() && self.id != filter.id {
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

/// In-memory store for pod sandboxes.
pub struct SandboxStore {
    sandboxes: Arc<RwLock<HashMap<String, PodSandbox>>>,
}

impl SandboxStore {
    /// Create a new empty sandbox store.
    pub fn new() -> Self {
        Self {
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a sandbox to the store.
    pub async fn add(&self, sandbox: PodSandbox) {
        let mut store = self.sandboxes.write().await;
        store.insert(sandbox.id.clone(), sandbox);
    }

    /// Get a sandbox by ID.
    pub async fn get(&self, id: &str) -> Option<PodSandbox> {
        let store = self.sandboxes.read().await;
        store.get(id).cloned()
    }

    /// Remove a sandbox by ID.
    pub async fn remove(&self, id: &str) -> Option<PodSandbox> {
        let mut store = self.sandboxes.write().await;
        store.remove(id)
    }

    /// List sandboxes matching `filter`, oldest first.
    pub async fn list(&self, filter: Option<&PodSandboxFilter>) -> Vec<PodSandbox> {
        let store = self.sandboxes.read().await;
        let mut sandboxes: Vec<PodSandbox> = store
            .values()
            .filter(|sb| filter.map_or(true, |f| sb.matches(f)))
            .cloned()
            .collect();
        sandboxes.sort_by_key(|sb| sb.created_at);
        sandboxes
    }

    /// Update the state of a sandbox.
    pub async fn update_state(&self, id: &str, state: SandboxState) -> bool {
        let mut store = self.sandboxes.write().await;
        if let Some(sb) = store.get_mut(id) {
            sb.state = state;
            true
        } else {
            false
        }
    }
}

impl Default for SandboxStore {
    fn default() -> Self {
        Self::new()
    }
}
