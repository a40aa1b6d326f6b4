use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{segments, Revision, StoreError, Write};

/// In-memory JSON tree shared by the store implementations.
///
/// Empty objects and `null`s are pruned on write, so a removed collection reads
/// back as absent rather than `{}`.
#[derive(Debug)]
pub(crate) struct Tree {
    root: Value,
    clock: Revision,
    /// Last revision that touched each top-level key.
    collections: HashMap<String, Revision>,
    /// Last revision of a write addressed at the root itself.
    root_revision: Revision,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            clock: 0,
            collections: HashMap::new(),
            root_revision: 0,
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let mut node = &self.root;
        for seg in segments(path)? {
            match node.get(seg) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        if is_empty(node) {
            return Ok(None);
        }
        Ok(Some(node.clone()))
    }

    pub fn revision(&self, collection: &str) -> Result<Revision, StoreError> {
        let segs = segments(collection)?;
        let own = segs
            .first()
            .and_then(|c| self.collections.get(*c))
            .copied()
            .unwrap_or(0);
        Ok(own.max(self.root_revision))
    }

    /// Check that `write` can be applied, without changing anything.
    pub fn check(write: &Write) -> Result<(), StoreError> {
        segments(write.path())?;
        if let Write::Update { partial, .. } = write {
            for key in partial.keys() {
                segments(key)?;
            }
        }
        Ok(())
    }

    pub fn apply(&mut self, write: &Write) -> Result<(), StoreError> {
        Self::check(write)?;
        self.clock += 1;
        let rev = self.clock;
        match write {
            Write::Set { path, value } => {
                let segs = segments(path)?;
                self.touch(&segs, rev);
                set_at(&mut self.root, &segs, value.clone());
            }
            Write::Remove { path } => {
                let segs = segments(path)?;
                self.touch(&segs, rev);
                set_at(&mut self.root, &segs, Value::Null);
            }
            Write::Update { path, partial } => {
                let base = segments(path)?;
                for (key, value) in partial {
                    let mut full = base.clone();
                    full.extend(segments(key)?);
                    self.touch(&full, rev);
                    set_at(&mut self.root, &full, value.clone());
                }
            }
        }
        if !self.root.is_object() {
            self.root = Value::Object(Map::new());
        }
        Ok(())
    }

    fn touch(&mut self, segs: &[&str], rev: Revision) {
        match segs.first() {
            Some(collection) => {
                self.collections.insert(collection.to_string(), rev);
            }
            None => self.root_revision = rev,
        }
    }
}

fn is_empty(node: &Value) -> bool {
    match node {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn set_at(node: &mut Value, segs: &[&str], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    let map = ensure_object(node);
    let child = map.entry(head.to_string()).or_insert(Value::Null);
    set_at(child, rest, value);
    let prune = is_empty(child);
    if prune {
        map.remove(*head);
    }
}
