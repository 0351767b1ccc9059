//! Raw document storage.
//!
//! Keys always have the layout `"{workspace}/{filename}"`.

mod local;
mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;

use crate::error::{RagError, RagResult};
use crate::models::{Namespace, ObjectEntry};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under the workspace and return the object key.
    async fn put(&self, namespace: &Namespace, filename: &str, bytes: Vec<u8>) -> RagResult<String>;

    /// Missing keys are `NotFound`.
    async fn get(&self, key: &str) -> RagResult<Vec<u8>>;

    async fn list(&self, namespace: &Namespace) -> RagResult<Vec<ObjectEntry>>;
}

pub fn object_key(namespace: &Namespace, filename: &str) -> String {
    format!("{}/{}", namespace, filename)
}

/// Reject anything that could escape the workspace directory.
pub(crate) fn validate_filename(filename: &str) -> RagResult<&str> {
    let name = filename.trim();
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(RagError::InvalidInput(format!("invalid filename: {:?}", filename)));
    }
    Ok(name)
}

/// Split a key into its workspace and filename parts.
pub(crate) fn split_key(key: &str) -> RagResult<(Namespace, &str)> {
    let (workspace, filename) = key
        .split_once('/')
        .ok_or_else(|| RagError::InvalidInput(format!("invalid object key: {:?}", key)))?;
    let namespace = Namespace::for_workspace(workspace)?;
    let filename = validate_filename(filename)?;
    Ok((namespace, filename))
}
