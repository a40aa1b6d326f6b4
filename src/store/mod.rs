//! Minimal document-store contract the booking core depends on.
//!
//! The store is a JSON tree addressed by `/`-separated paths. Besides plain CRUD it
//! tracks a revision per top-level collection so writers can make a write
//! conditional on nobody else having written under the same collection since they
//! read it.

mod durable;
mod memory;
mod tree;

pub use durable::{run_compactor, WalStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Monotonic write counter of a collection.
pub type Revision = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store codec error: {0}")]
    Codec(String),
    #[error("store closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// A value read together with the revision of its collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: Revision,
}

/// A single mutation of the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replace the node at `path`. Writing `null` removes it.
    Set { path: String, value: Value },
    /// Set each key of `partial` as a child of `path`, leaving other children alone.
    Update {
        path: String,
        partial: Map<String, Value>,
    },
    Remove { path: String },
}

impl Write {
    pub fn path(&self) -> &str {
        match self {
            Write::Set { path, .. } | Write::Update { path, .. } | Write::Remove { path } => path,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Reserve a fresh child key under `path`. Nothing is written.
    async fn push(&self, path: &str) -> Result<String, StoreError>;

    /// Read `path` together with the current revision of its collection.
    async fn snapshot(&self, path: &str) -> Result<Versioned<Option<Value>>, StoreError>;

    /// Apply `write` only if `collection` is still at `expected`. Returns `false`
    /// without writing when someone else got there first.
    async fn commit_if(
        &self,
        collection: &str,
        expected: Revision,
        write: Write,
    ) -> Result<bool, StoreError>;
}

/// Monotonic ULID source for `push`. Keys sort in the order they were handed out,
/// so a collection read back in key order is in insertion order.
pub(crate) struct KeyGen(std::sync::Mutex<ulid::Generator>);

impl Default for KeyGen {
    fn default() -> Self {
        Self(std::sync::Mutex::new(ulid::Generator::new()))
    }
}

impl std::fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyGen")
    }
}

impl KeyGen {
    pub fn next_key(&self) -> String {
        let mut generator = self.0.lock().unwrap_or_else(|e| e.into_inner());
        generator
            .generate()
            .unwrap_or_else(|_| ulid::Ulid::new())
            .to_string()
    }
}

/// Split a path into its segments. Leading and trailing slashes are ignored; an
/// empty path addresses the root.
pub(crate) fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let segs: Vec<&str> = trimmed.split('/').collect();
    if segs
        .iter()
        .any(|s| s.is_empty() || s.chars().any(|c| c.is_control() || matches!(c, '.' | '#' | '$' | '[' | ']')))
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_trim_slashes() {
        assert_eq!(segments("/bookings/abc/").unwrap(), vec!["bookings", "abc"]);
        assert!(segments("").unwrap().is_empty());
        assert!(segments("/").unwrap().is_empty());
    }

    #[test]
    fn segments_reject_bad_keys() {
        assert!(matches!(segments("a//b"), Err(StoreError::InvalidPath(_))));
        assert!(matches!(segments("a/b.c"), Err(StoreError::InvalidPath(_))));
        assert!(matches!(segments("a/[0]"), Err(StoreError::InvalidPath(_))));
    }
}
