//! Persisted dependency graph and the object-store capability behind it.
//!
//! One JSON object per namespace holds the previous invocation's graph.
//! Mutations require a TTL lock; writes are conditional on the lock token
//! and versioned by content digest so a crashed holder expires instead of
//! wedging the namespace.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::graph::Graph;
use crate::events::generate_run_id;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object '{key}' is locked by another invocation")]
    LockHeld { key: String },

    #[error("lock token for '{key}' is stale or already released")]
    StaleToken { key: String },

    #[error("cannot read '{key}': {reason}")]
    Read { key: String, reason: String },

    #[error("cannot write '{key}': {reason}")]
    Write { key: String, reason: String },

    #[error("invalid persisted graph at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Proof of lock ownership for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub code: String,
}

/// Object storage with TTL locks and conditional writes.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError>;

    /// Write only while holding the lock for `key`.
    fn put_locked(&self, key: &str, body: &[u8], token: &LockToken) -> Result<(), StoreError>;

    /// Acquire the lock for `key`, stealing it if the holder's TTL lapsed.
    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, StoreError>;

    fn release(&self, token: &LockToken) -> Result<(), StoreError>;

    fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), StoreError>;
}

/// Artifact uploads (rendered templates); returns a retrieval URL.
pub trait ArtifactStore: Send + Sync {
    fn put_artifact(&self, key: &str, body: &[u8]) -> Result<String, StoreError>;
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Digest used as the stored object's version tag.
fn content_version(body: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(body).to_hex())
}

// ============================================================================
// Persisted graph object
// ============================================================================

/// Stored form: `{"version": 1, "nodes": {name: [deps...]}}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedGraph {
    pub version: u32,
    pub nodes: IndexMap<String, Vec<String>>,
}

impl PersistedGraph {
    pub fn from_graph(graph: &Graph) -> Self {
        Self { version: 1, nodes: graph.to_adjacency() }
    }

    pub fn to_graph(&self) -> Result<Graph, super::graph::GraphError> {
        Graph::from_adjacency(&self.nodes)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn add(&mut self, name: &str, deps: &[String]) {
        self.nodes.insert(name.to_string(), deps.to_vec());
    }

    /// Drop a node and references to it.
    pub fn remove(&mut self, name: &str) {
        self.nodes.shift_remove(name);
        for deps in self.nodes.values_mut() {
            deps.retain(|d| d != name);
        }
    }

    /// Load from the store; an absent object is an empty graph.
    pub fn load(store: &dyn ObjectStore, key: &str) -> Result<Self, StoreError> {
        match store.get(key)? {
            None => Ok(Self { version: 1, nodes: IndexMap::new() }),
            Some(body) => serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Write back under the held lock.
    pub fn save(
        &self,
        store: &dyn ObjectStore,
        key: &str,
        token: &LockToken,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        store.put_locked(key, &body, token)
    }
}

// ============================================================================
// Local directory store
// ============================================================================

#[derive(Serialize, Deserialize)]
struct LockFile {
    code: String,
    expires_at: u64,
}

/// Object store rooted in a local directory. Objects are files; locks are
/// sibling `.lock` files carrying the token and expiry; writes are atomic
/// via temp file + rename.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.lock", key))
    }

    fn read_lock(&self, key: &str) -> Result<Option<LockFile>, StoreError> {
        let path = self.lock_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let lock: LockFile = serde_json::from_str(&content).map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: format!("invalid lock file: {}", e),
        })?;
        Ok(Some(lock))
    }

    fn write_lock(&self, key: &str, lock: &LockFile) -> Result<(), StoreError> {
        let path = self.lock_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }
        let body = serde_json::to_vec(lock).expect("lock file serializes");
        atomic_write(&path, &body).map_err(|reason| StoreError::Write {
            key: key.to_string(),
            reason,
        })
    }

    fn holds(&self, token: &LockToken) -> Result<bool, StoreError> {
        match self.read_lock(&token.key)? {
            Some(lock) => Ok(lock.code == token.code && lock.expires_at > epoch_secs()),
            None => Ok(false),
        }
    }
}

fn atomic_write(path: &Path, body: &[u8]) -> Result<(), String> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body).map_err(|e| e.to_string())?;
    std::fs::rename(&tmp, path).map_err(|e| e.to_string())
}

impl ObjectStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path).map(Some).map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }
        atomic_write(&path, body).map_err(|reason| StoreError::Write {
            key: key.to_string(),
            reason,
        })
    }

    fn put_locked(&self, key: &str, body: &[u8], token: &LockToken) -> Result<(), StoreError> {
        if token.key != key || !self.holds(token)? {
            return Err(StoreError::StaleToken { key: key.to_string() });
        }
        self.put(key, body)
    }

    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, StoreError> {
        if let Some(existing) = self.read_lock(key)? {
            if existing.expires_at > epoch_secs() {
                return Err(StoreError::LockHeld { key: key.to_string() });
            }
            // expired holder: steal
        }
        let token = LockToken { key: key.to_string(), code: generate_run_id() };
        self.write_lock(
            key,
            &LockFile {
                code: token.code.clone(),
                expires_at: epoch_secs() + ttl.as_secs(),
            },
        )?;
        Ok(token)
    }

    fn release(&self, token: &LockToken) -> Result<(), StoreError> {
        if !self.holds(token)? {
            return Err(StoreError::StaleToken { key: token.key.clone() });
        }
        std::fs::remove_file(self.lock_path(&token.key)).map_err(|e| StoreError::Write {
            key: token.key.clone(),
            reason: e.to_string(),
        })
    }

    fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), StoreError> {
        if !self.holds(token)? {
            return Err(StoreError::StaleToken { key: token.key.clone() });
        }
        self.write_lock(
            &token.key,
            &LockFile {
                code: token.code.clone(),
                expires_at: epoch_secs() + ttl.as_secs(),
            },
        )
    }
}

impl ArtifactStore for DirStore {
    fn put_artifact(&self, key: &str, body: &[u8]) -> Result<String, StoreError> {
        self.put(key, body)?;
        Ok(format!("file://{}", self.object_path(key).display()))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryStoreInner {
    objects: HashMap<String, (Vec<u8>, String)>,
    locks: HashMap<String, LockFile>,
}

/// Object store for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version digest of a stored object, for assertions.
    pub fn version_of(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("store lock");
        inner.objects.get(key).map(|(_, version)| version.clone())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("store lock");
        inner
            .locks
            .get(key)
            .is_some_and(|lock| lock.expires_at > epoch_secs())
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.objects.get(key).map(|(body, _)| body.clone()))
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .objects
            .insert(key.to_string(), (body.to_vec(), content_version(body)));
        Ok(())
    }

    fn put_locked(&self, key: &str, body: &[u8], token: &LockToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let valid = inner
            .locks
            .get(key)
            .is_some_and(|lock| lock.code == token.code && lock.expires_at > epoch_secs());
        if token.key != key || !valid {
            return Err(StoreError::StaleToken { key: key.to_string() });
        }
        inner
            .objects
            .insert(key.to_string(), (body.to_vec(), content_version(body)));
        Ok(())
    }

    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(existing) = inner.locks.get(key) {
            if existing.expires_at > epoch_secs() {
                return Err(StoreError::LockHeld { key: key.to_string() });
            }
        }
        let token = LockToken { key: key.to_string(), code: generate_run_id() };
        inner.locks.insert(
            key.to_string(),
            LockFile {
                code: token.code.clone(),
                expires_at: epoch_secs() + ttl.as_secs(),
            },
        );
        Ok(token)
    }

    fn release(&self, token: &LockToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let valid = inner
            .locks
            .get(&token.key)
            .is_some_and(|lock| lock.code == token.code);
        if !valid {
            return Err(StoreError::StaleToken { key: token.key.clone() });
        }
        inner.locks.remove(&token.key);
        Ok(())
    }

    fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        match inner.locks.get_mut(&token.key) {
            Some(lock) if lock.code == token.code => {
                lock.expires_at = epoch_secs() + ttl.as_secs();
                Ok(())
            }
            _ => Err(StoreError::StaleToken { key: token.key.clone() }),
        }
    }
}

impl ArtifactStore for MemoryStore {
    fn put_artifact(&self, key: &str, body: &[u8]) -> Result<String, StoreError> {
        self.put(key, body)?;
        Ok(format!("memory://{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_persist_graph_round_trip() {
        let mut graph = Graph::new();
        graph.add("vpc").unwrap();
        graph.add("bastion").unwrap();
        graph.connect("bastion", "vpc").unwrap();

        let persisted = PersistedGraph::from_graph(&graph);
        let json = serde_json::to_string(&persisted).unwrap();
        assert!(json.contains("\"version\":1"));

        let loaded: PersistedGraph = serde_json::from_str(&json).unwrap();
        let rebuilt = loaded.to_graph().unwrap();
        assert!(rebuilt.has_edge("bastion", "vpc"));
    }

    #[test]
    fn test_persist_wire_format() {
        let body = r#"{"version": 1, "nodes": {"vpc": [], "bastion": ["vpc"]}}"#;
        let parsed: PersistedGraph = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.nodes["bastion"], vec!["vpc"]);
    }

    #[test]
    fn test_persist_absent_is_empty() {
        let store = MemoryStore::new();
        let graph = PersistedGraph::load(&store, "ns.json").unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_persist_remove_drops_references() {
        let mut graph = PersistedGraph::default();
        graph.add("vpc", &[]);
        graph.add("bastion", &["vpc".to_string()]);
        graph.remove("vpc");
        assert!(!graph.contains("vpc"));
        assert!(graph.nodes["bastion"].is_empty());
    }

    #[test]
    fn test_persist_save_requires_lock() {
        let store = MemoryStore::new();
        let graph = PersistedGraph::default();
        let bogus = LockToken { key: "ns.json".to_string(), code: "run-0-0".to_string() };
        assert!(matches!(
            graph.save(&store, "ns.json", &bogus),
            Err(StoreError::StaleToken { .. })
        ));

        let token = store.acquire("ns.json", TTL).unwrap();
        graph.save(&store, "ns.json", &token).unwrap();
        assert!(store.get("ns.json").unwrap().is_some());
    }

    #[test]
    fn test_persist_lock_exclusive() {
        let store = MemoryStore::new();
        let token = store.acquire("k", TTL).unwrap();
        assert!(matches!(
            store.acquire("k", TTL),
            Err(StoreError::LockHeld { .. })
        ));
        store.release(&token).unwrap();
        store.acquire("k", TTL).unwrap();
    }

    #[test]
    fn test_persist_expired_lock_is_stolen() {
        let store = MemoryStore::new();
        let stale = store.acquire("k", Duration::ZERO).unwrap();
        // TTL of zero expires immediately; a new invocation may steal
        let fresh = store.acquire("k", TTL).unwrap();
        assert_ne!(stale.code, fresh.code);
        // the stale holder can no longer write
        assert!(matches!(
            store.put_locked("k", b"x", &stale),
            Err(StoreError::StaleToken { .. })
        ));
    }

    #[test]
    fn test_persist_renew_extends() {
        let store = MemoryStore::new();
        let token = store.acquire("k", TTL).unwrap();
        store.renew(&token, Duration::from_secs(600)).unwrap();
        assert!(store.is_locked("k"));
    }

    #[test]
    fn test_persist_version_changes_on_write() {
        let store = MemoryStore::new();
        store.put("k", b"one").unwrap();
        let v1 = store.version_of("k").unwrap();
        store.put("k", b"two").unwrap();
        let v2 = store.version_of("k").unwrap();
        assert_ne!(v1, v2);
        assert!(v1.starts_with("blake3:"));
    }

    #[test]
    fn test_persist_dir_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        assert!(store.get("graph.json").unwrap().is_none());
        store.put("graph.json", b"{}").unwrap();
        assert_eq!(store.get("graph.json").unwrap().unwrap(), b"{}");
        // atomic write leaves no temp file behind
        assert!(!dir.path().join("graph.tmp").exists());
    }

    #[test]
    fn test_persist_dir_store_locking() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let token = store.acquire("graph.json", TTL).unwrap();
        assert!(matches!(
            store.acquire("graph.json", TTL),
            Err(StoreError::LockHeld { .. })
        ));
        store.put_locked("graph.json", b"{}", &token).unwrap();
        store.release(&token).unwrap();
        assert!(!dir.path().join("graph.json.lock").exists());
    }

    #[test]
    fn test_persist_dir_store_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let url = store
            .put_artifact("templates/vpc.json", b"{\"Resources\":{}}")
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(dir.path().join("templates/vpc.json").exists());
    }
}
