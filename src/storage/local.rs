use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::{object_key, split_key, validate_filename, ObjectStore};
use crate::error::{RagError, RagResult};
use crate::models::{Namespace, ObjectEntry};

/// Filesystem-backed store rooted at `storage.root_dir`.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn workspace_dir(&self, namespace: &Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, namespace: &Namespace, filename: &str, bytes: Vec<u8>) -> RagResult<String> {
        let filename = validate_filename(filename)?;
        let dir = self.workspace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await.map_err(RagError::storage)?;
        tokio::fs::write(dir.join(filename), &bytes)
            .await
            .map_err(RagError::storage)?;

        let key = object_key(namespace, filename);
        tracing::debug!(key = %key, size = bytes.len(), "stored object");
        Ok(key)
    }

    async fn get(&self, key: &str) -> RagResult<Vec<u8>> {
        let (namespace, filename) = split_key(key)?;
        let path = self.workspace_dir(&namespace).join(filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RagError::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(RagError::storage(e)),
        }
    }

    async fn list(&self, namespace: &Namespace) -> RagResult<Vec<ObjectEntry>> {
        let dir = self.workspace_dir(namespace);
        let namespace = namespace.clone();

        tokio::task::spawn_blocking(move || {
            if !dir.exists() {
                return Vec::new();
            }
            let mut entries: Vec<ObjectEntry> = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let name = entry.file_name().to_str()?.to_string();
                    let metadata = entry.metadata().ok()?;
                    Some(ObjectEntry {
                        key: object_key(&namespace, &name),
                        name,
                        size: metadata.len(),
                        last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries
        })
        .await
        .map_err(RagError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let ns = Namespace::for_workspace("ws1").unwrap();

        let key = store.put(&ns, "b.txt", b"bee".to_vec()).await.unwrap();
        assert_eq!(key, "ws1/b.txt");
        store.put(&ns, "a.txt", b"ay".to_vec()).await.unwrap();

        assert_eq!(store.get("ws1/b.txt").await.unwrap(), b"bee");

        let listed = store.list(&ns).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(listed[1].size, 3);
        assert!(listed[1].last_modified.is_some());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get("ws1/nope.txt").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_workspace_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let ns = Namespace::for_workspace("empty").unwrap();
        assert!(store.list(&ns).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let ns = Namespace::for_workspace("ws1").unwrap();
        assert!(store.put(&ns, "../escape.txt", vec![]).await.is_err());
        assert!(store.get("ws1/../../etc/passwd").await.is_err());
    }
}
