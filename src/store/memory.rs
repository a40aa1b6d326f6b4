use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::tree::Tree;
use super::{segments, DocumentStore, KeyGen, Revision, StoreError, Versioned, Write};

/// Ephemeral store. Used by tests and by callers that keep nothing on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: RwLock<Tree>,
    keys: KeyGen,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::new()),
            keys: KeyGen::default(),
        }
    }

    async fn write(&self, write: Write) -> Result<(), StoreError> {
        self.tree.write().await.apply(&write)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.tree.read().await.get(path)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.write(Write::Set {
            path: path.to_string(),
            value,
        })
        .await
    }

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError> {
        self.write(Write::Update {
            path: path.to_string(),
            partial,
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.write(Write::Remove {
            path: path.to_string(),
        })
        .await
    }

    async fn push(&self, path: &str) -> Result<String, StoreError> {
        segments(path)?;
        Ok(self.keys.next_key())
    }

    async fn snapshot(&self, path: &str) -> Result<Versioned<Option<Value>>, StoreError> {
        let tree = self.tree.read().await;
        Ok(Versioned {
            value: tree.get(path)?,
            revision: tree.revision(path)?,
        })
    }

    async fn commit_if(
        &self,
        collection: &str,
        expected: Revision,
        write: Write,
    ) -> Result<bool, StoreError> {
        let mut tree = self.tree.write().await;
        if tree.revision(collection)? != expected {
            return Ok(false);
        }
        tree.apply(&write)?;
        Ok(true)
    }
}
