use super::{MemoryDirectory, RedisDirectory, ShardDirectory, SqliteDirectory};
use crate::{GeoShardError, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct DirectoryBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    sqlite_path: Option<PathBuf>,
    redis_url: Option<String>,
}

impl DirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(GeoShardError::Config(
                "directory namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(GeoShardError::Config(
                "directory backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn ShardDirectory>> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "memory" => Ok(Arc::new(MemoryDirectory::new())),
            "sqlite" => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    GeoShardError::Config("sqlite path is required for sqlite backend".to_string())
                })?;

                let directory = SqliteDirectory::new(path, &namespace)?;
                Ok(Arc::new(directory))
            }
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(GeoShardError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let directory = RedisDirectory::new(url, &namespace).await?;
                Ok(Arc::new(directory))
            }
            other => Err(GeoShardError::Config(format!(
                "unsupported directory backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeoRange, ShardRecord};

    #[tokio::test]
    async fn test_builds_memory_backend() {
        let directory = DirectoryBuilder::new()
            .backend("Memory")
            .namespace("test")
            .build()
            .await
            .unwrap();

        directory
            .insert(&ShardRecord::new("a", "a", GeoRange::WORLD))
            .await
            .unwrap();
        assert_eq!(directory.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_builds_sqlite_backend() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = DirectoryBuilder::new()
            .backend("sqlite")
            .namespace("test")
            .sqlite_path(temp_dir.path().join("shards.db"))
            .build()
            .await
            .unwrap();

        assert!(directory.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_missing_settings() {
        let missing_namespace = DirectoryBuilder::new().backend("memory").build().await;
        assert!(matches!(missing_namespace, Err(GeoShardError::Config(_))));

        let missing_path = DirectoryBuilder::new()
            .backend("sqlite")
            .namespace("test")
            .build()
            .await;
        assert!(matches!(missing_path, Err(GeoShardError::Config(_))));

        let unknown = DirectoryBuilder::new()
            .backend("etcd")
            .namespace("test")
            .build()
            .await;
        assert!(matches!(unknown, Err(GeoShardError::Config(_))));
    }
}
