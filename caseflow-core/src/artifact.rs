//! Radiograph artifact storage port.
//!
//! Binary content goes straight from the upload client to the artifact
//! store; the coordinator only ever sees the returned reference and checks
//! that it resolves.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),

    #[error("artifact not found: {0}")]
    NotFound(String),
}

/// Storage key for a case's radiograph, e.g. `xray/<case>/chest-pa.png`.
pub fn xray_key(case_id: Uuid, file_name: &str) -> String {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    format!("xray/{}/{}", case_id, name)
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store content under `key`, returning the reference to record.
    async fn put(&self, key: &str, content: &[u8], content_type: &str)
        -> Result<String, ArtifactError>;

    async fn get(&self, artifact_ref: &str) -> Result<Vec<u8>, ArtifactError>;

    async fn exists(&self, artifact_ref: &str) -> Result<bool, ArtifactError>;
}

/// Artifacts as files under a root directory; references are `file://` URIs.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, artifact_ref: &str) -> Result<PathBuf, ArtifactError> {
        let path = artifact_ref
            .strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| ArtifactError::InvalidRef(artifact_ref.to_string()))?;
        if !path.starts_with(&self.root) {
            return Err(ArtifactError::InvalidRef(artifact_ref.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        key: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, ArtifactError> {
        if key.split('/').any(|part| part == "..") {
            return Err(ArtifactError::InvalidRef(key.to_string()));
        }
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, artifact_ref: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(artifact_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(artifact_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, artifact_ref: &str) -> Result<bool, ArtifactError> {
        let path = self.resolve(artifact_ref)?;
        Ok(tokio::fs::try_exists(path).await?)
    }
}

/// In-process artifact store; references are `memory://` URIs.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        key: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, ArtifactError> {
        let artifact_ref = format!("memory://{}", key);
        self.blobs
            .write()
            .await
            .insert(artifact_ref.clone(), content.to_vec());
        Ok(artifact_ref)
    }

    async fn get(&self, artifact_ref: &str) -> Result<Vec<u8>, ArtifactError> {
        self.blobs
            .read()
            .await
            .get(artifact_ref)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(artifact_ref.to_string()))
    }

    async fn exists(&self, artifact_ref: &str) -> Result<bool, ArtifactError> {
        Ok(self.blobs.read().await.contains_key(artifact_ref))
    }
}
