//! Image records for the local engine.
//!
//! Images are tracked by normalized reference. Their ID is a content-style
//! digest of that reference, so the same reference always resolves to the
//! same ID.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::cri_api::{self, ImageSpec};

/// A pulled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// `sha256:<hex>` image ID.
    pub id: String,
    /// Normalized reference, e.g. `nginx:latest`.
    pub reference: String,
    /// Pull timestamp in nanoseconds.
    pub pulled_at: i64,
}

impl StoredImage {
    pub fn to_cri(&self) -> cri_api::Image {
        cri_api::Image {
            id: self.id.clone(),
            repo_tags: vec![self.reference.clone()],
            repo_digests: vec![format!("{}@{}", repository(&self.reference), self.id)],
            size: 0,
            uid: None,
            username: String::new(),
            spec: Some(ImageSpec {
                image: self.reference.clone(),
                annotations: Default::default(),
            }),
            pinned: false,
        }
    }
}

/// Append `:latest` to references that carry neither tag nor digest.
pub fn normalize(reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains('@') {
        return reference.to_string();
    }
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

/// Image ID for a normalized reference.
pub fn image_id(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Reference without its tag or digest.
fn repository(reference: &str) -> &str {
    if let Some((repo, _)) = reference.split_once('@') {
        return repo;
    }
    match reference.rfind(':') {
        Some(pos) if !reference[pos..].contains('/') => &reference[..pos],
        _ => reference,
    }
}

/// In-memory store for images, keyed by normalized reference.
pub struct ImageStore {
    images: Arc<RwLock<HashMap<String, StoredImage>>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            images: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record an image. Pulling a known reference again keeps its ID.
    pub async fn add(&self, reference: &str, pulled_at: i64) -> StoredImage {
        let reference = normalize(reference);
        let mut store = self.images.write().await;
        store
            .entry(reference.clone())
            .or_insert_with(|| StoredImage {
                id: image_id(&reference),
                reference,
                pulled_at,
            })
            .clone()
    }

    /// Look up an image by reference or by ID.
    pub async fn get(&self, reference_or_id: &str) -> Option<StoredImage> {
        let store = self.images.read().await;
        if let Some(image) = store.get(&normalize(reference_or_id)) {
            return Some(image.clone());
        }
        store.values().find(|img| img.id == reference_or_id).cloned()
    }

    /// Remove an image by reference or by ID.
    pub async fn remove(&self, reference_or_id: &str) -> Option<StoredImage> {
        let mut store = self.images.write().await;
        let key = normalize(reference_or_id);
        if let Some(image) = store.remove(&key) {
            return Some(image);
        }
        let key = store
            .iter()
            .find(|(_, img)| img.id == reference_or_id)
            .map(|(k, _)| k.clone())?;
        store.remove(&key)
    }

    /// List all images, oldest pull first.
    pub async fn list(&self) -> Vec<StoredImage> {
        let store = self.images.read().await;
        let mut images: Vec<StoredImage> = store.values().cloned().collect();
        images.sort_by(|a, b| a.pulled_at.cmp(&b.pulled_at).then(a.reference.cmp(&b.reference)));
        images
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("nginx"), "nginx:latest");
        assert_eq!(normalize("nginx:1.25"), "nginx:1.25");
        assert_eq!(normalize("registry:5000/app"), "registry:5000/app:latest");
        assert_eq!(normalize("registry:5000/app:v2"), "registry:5000/app:v2");
        assert_eq!(normalize("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_image_id_is_stable() {
        let id = image_id("nginx:latest");
        assert!(id.starts_with("sha256:"));
        assert_eq!(id.len(), "sha256:".len() + 64);
        assert_eq!(id, image_id("nginx:latest"));
        assert_ne!(id, image_id("nginx:1.25"));
    }

    #[test]
    fn test_repository() {
        assert_eq!(repository("nginx:latest"), "nginx");
        assert_eq!(repository("registry:5000/app:v2"), "registry:5000/app");
        assert_eq!(repository("app@sha256:abc"), "app");
    }

    #[tokio::test]
    async fn test_add_get_by_reference_and_id() {
        let store = ImageStore::new();
        let image = store.add("nginx", 1).await;
        assert_eq!(image.reference, "nginx:latest");

        assert_eq!(store.get("nginx").await, Some(image.clone()));
        assert_eq!(store.get("nginx:latest").await, Some(image.clone()));
        assert_eq!(store.get(&image.id).await, Some(image.clone()));
        assert!(store.get("redis").await.is_none());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = ImageStore::new();
        let first = store.add("nginx:latest", 1).await;
        let second = store.add("nginx", 2).await;
        assert_eq!(first, second);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let store = ImageStore::new();
        let image = store.add("busybox:1.36", 1).await;
        assert!(store.remove(&image.id).await.is_some());
        assert!(store.remove("busybox:1.36").await.is_none());
        assert!(store.list().await.is_empty());
    }

    #[test]
    fn test_to_cri() {
        let image = StoredImage {
            id: image_id("nginx:latest"),
            reference: "nginx:latest".to_string(),
            pulled_at: 0,
        };
        let cri = image.to_cri();
        assert_eq!(cri.repo_tags, vec!["nginx:latest".to_string()]);
        assert_eq!(cri.repo_digests[0], format!("nginx@{}", image.id));
    }
}
