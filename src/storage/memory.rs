use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{object_key, split_key, validate_filename, ObjectStore};
use crate::error::{RagError, RagResult};
use crate::models::{Namespace, ObjectEntry};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RagError {
    RagError::Storage("object store lock poisoned".into())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, namespace: &Namespace, filename: &str, bytes: Vec<u8>) -> RagResult<String> {
        let key = object_key(namespace, validate_filename(filename)?);
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .insert(key.clone(), (bytes, Utc::now()));
        Ok(key)
    }

    async fn get(&self, key: &str) -> RagResult<Vec<u8>> {
        split_key(key)?;
        self.objects
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| RagError::NotFound(format!("object {}", key)))
    }

    async fn list(&self, namespace: &Namespace) -> RagResult<Vec<ObjectEntry>> {
        let prefix = format!("{}/", namespace);
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, (bytes, modified))| ObjectEntry {
                name: key[prefix.len()..].to_string(),
                key: key.clone(),
                size: bytes.len() as u64,
                last_modified: Some(*modified),
            })
            .collect())
    }
}
