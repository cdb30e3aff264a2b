//! Persisted mapping of original templates to node-local copies
//!
//! Keyed by the original template vmid; the value maps target node to the
//! local template vmid. The cluster stays authoritative, entries are hints.

use std::collections::BTreeMap;
use std::path::Path;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use thiserror::Error;

/// original vmid -> JSON `{node: local_vmid}`
const TEMPLATE_MAPPINGS: TableDefinition<u32, &[u8]> = TableDefinition::new("template_mappings");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt record for template {vmid}: {reason}")]
    Corrupt { vmid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn backend(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Backend(err.into().to_string())
}

/// One `(original, node) -> local` mapping
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TemplateRecord {
    pub original_vmid: u32,
    pub node: String,
    pub local_vmid: u32,
}

/// Repository for template mappings
pub trait TemplateStore: Send + Sync {
    fn get(&self, original_vmid: u32, node: &str) -> Result<Option<u32>, StoreError>;

    fn put(&self, original_vmid: u32, node: &str, local_vmid: u32) -> Result<(), StoreError>;

    /// Returns whether an entry was removed
    fn remove(&self, original_vmid: u32, node: &str) -> Result<bool, StoreError>;

    fn records(&self) -> Result<Vec<TemplateRecord>, StoreError>;
}

// ============================================================================
// SBIO: Pure encoding (no I/O)
// ============================================================================

type NodeMap = BTreeMap<String, u32>;

fn decode(vmid: u32, bytes: &[u8]) -> Result<NodeMap, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        vmid,
        reason: e.to_string(),
    })
}

fn encode(vmid: u32, map: &NodeMap) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(map).map_err(|e| StoreError::Corrupt {
        vmid,
        reason: e.to_string(),
    })
}

fn flatten(original_vmid: u32, map: NodeMap) -> impl Iterator<Item = TemplateRecord> {
    map.into_iter().map(move |(node, local_vmid)| TemplateRecord {
        original_vmid,
        node,
        local_vmid,
    })
}

// ============================================================================
// SBIO: I/O implementation (embedded database)
// ============================================================================

pub struct RedbTemplateStore {
    db: Database,
}

impl RedbTemplateStore {
    /// Open or create the database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(backend)?;

        // Materialize the table so read transactions can open it
        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(TEMPLATE_MAPPINGS).map_err(backend)?;
        txn.commit().map_err(backend)?;

        Ok(Self { db })
    }

    fn load(&self, original_vmid: u32) -> Result<NodeMap, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(TEMPLATE_MAPPINGS).map_err(backend)?;
        let map = match table.get(original_vmid).map_err(backend)? {
            Some(bytes) => decode(original_vmid, bytes.value())?,
            None => NodeMap::new(),
        };
        Ok(map)
    }

    /// Read-modify-write of one entry inside a single write transaction
    fn update<F>(&self, original_vmid: u32, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut NodeMap) -> bool,
    {
        let txn = self.db.begin_write().map_err(backend)?;
        let changed = {
            let mut table = txn.open_table(TEMPLATE_MAPPINGS).map_err(backend)?;
            let existing = table
                .get(original_vmid)
                .map_err(backend)?
                .map(|bytes| bytes.value().to_vec());
            let mut map = match existing {
                Some(bytes) => decode(original_vmid, &bytes)?,
                None => NodeMap::new(),
            };
            let changed = change(&mut map);
            if changed {
                if map.is_empty() {
                    table.remove(original_vmid).map_err(backend)?;
                } else {
                    let bytes = encode(original_vmid, &map)?;
                    table
                        .insert(original_vmid, bytes.as_slice())
                        .map_err(backend)?;
                }
            }
            changed
        };
        txn.commit().map_err(backend)?;
        Ok(changed)
    }
}

impl TemplateStore for RedbTemplateStore {
    fn get(&self, original_vmid: u32, node: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.load(original_vmid)?.get(node).copied())
    }

    fn put(&self, original_vmid: u32, node: &str, local_vmid: u32) -> Result<(), StoreError> {
        self.update(original_vmid, |map| {
            map.insert(node.to_string(), local_vmid);
            true
        })?;
        Ok(())
    }

    fn remove(&self, original_vmid: u32, node: &str) -> Result<bool, StoreError> {
        self.update(original_vmid, |map| map.remove(node).is_some())
    }

    fn records(&self) -> Result<Vec<TemplateRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(TEMPLATE_MAPPINGS).map_err(backend)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            let vmid = key.value();
            records.extend(flatten(vmid, decode(vmid, value.value())?));
        }
        Ok(records)
    }
}

/// Volatile store for tests and runs without a cache file
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    entries: DashMap<u32, NodeMap>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn get(&self, original_vmid: u32, node: &str) -> Result<Option<u32>, StoreError> {
        Ok(self
            .entries
            .get(&original_vmid)
            .and_then(|map| map.get(node).copied()))
    }

    fn put(&self, original_vmid: u32, node: &str, local_vmid: u32) -> Result<(), StoreError> {
        self.entries
            .entry(original_vmid)
            .or_default()
            .insert(node.to_string(), local_vmid);
        Ok(())
    }

    fn remove(&self, original_vmid: u32, node: &str) -> Result<bool, StoreError> {
        let removed = self
            .entries
            .get_mut(&original_vmid)
            .map(|mut map| map.remove(node).is_some())
            .unwrap_or(false);
        self.entries.remove_if(&original_vmid, |_, map| map.is_empty());
        Ok(removed)
    }

    fn records(&self) -> Result<Vec<TemplateRecord>, StoreError> {
        let mut records: Vec<TemplateRecord> = self
            .entries
            .iter()
            .flat_map(|entry| flatten(*entry.key(), entry.value().clone()))
            .collect();
        records.sort();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn TemplateStore) {
        assert_eq!(store.get(100, "pve2").unwrap(), None);
        store.put(100, "pve2", 150).unwrap();
        store.put(100, "pve3", 151).unwrap();
        assert_eq!(store.get(100, "pve2").unwrap(), Some(150));

        store.put(100, "pve2", 160).unwrap();
        assert_eq!(store.get(100, "pve2").unwrap(), Some(160));

        assert!(store.remove(100, "pve2").unwrap());
        assert!(!store.remove(100, "pve2").unwrap());
        assert_eq!(
            store.records().unwrap(),
            vec![TemplateRecord {
                original_vmid: 100,
                node: "pve3".to_string(),
                local_vmid: 151,
            }]
        );
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryTemplateStore::new());
    }

    #[test]
    fn test_redb_store() {
        let dir = TempDir::new().unwrap();
        let store = RedbTemplateStore::open(&dir.path().join("templates.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("templates.redb");
        {
            let store = RedbTemplateStore::open(&path).unwrap();
            store.put(200, "pve1", 210).unwrap();
        }
        let store = RedbTemplateStore::open(&path).unwrap();
        assert_eq!(store.get(200, "pve1").unwrap(), Some(210));
    }

    #[test]
    fn test_empty_entry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = RedbTemplateStore::open(&dir.path().join("t.redb")).unwrap();
        store.put(300, "pve1", 310).unwrap();
        store.remove(300, "pve1").unwrap();
        assert!(store.records().unwrap().is_empty());
    }
}
