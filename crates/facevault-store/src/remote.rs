//! Authoritative remote tier.
//!
//! Implementations are blocking and driven from the replication worker
//! thread, never from a caller's task.

use facevault_core::{Embedding, RegistryRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const EMBEDDINGS_DIR: &str = "embeddings";
const REGISTRY_DIR: &str = "registry";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote I/O on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("remote document {0} is corrupt: {1}")]
    Codec(String, serde_json::Error),
    #[error("replication worker exited")]
    ChannelClosed,
    #[error("no remote tier configured")]
    Disabled,
}

/// Push/pull/delete against the authoritative store.
pub trait RemoteStore: Send + 'static {
    fn push_embedding(&mut self, embedding: &Embedding) -> Result<(), RemoteError>;

    fn pull_embedding(&mut self, identity_id: &str) -> Result<Option<Embedding>, RemoteError>;

    fn delete_embedding(&mut self, identity_id: &str) -> Result<(), RemoteError>;

    fn push_record(&mut self, record: &RegistryRecord) -> Result<(), RemoteError>;

    /// Every registry record keyed by identity.
    fn pull_records(&mut self) -> Result<HashMap<String, RegistryRecord>, RemoteError>;

    fn delete_record(&mut self, identity_id: &str) -> Result<(), RemoteError>;

    /// Short human-readable description for status output.
    fn describe(&self) -> String;
}

/// JSON documents under a shared directory (e.g. a network mount).
///
/// Layout: `<root>/embeddings/<hex(id)>.json` and
/// `<root>/registry/<hex(id)>.json`. The root itself is never created; a
/// missing root means the remote is unreachable.
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection(&self, name: &str) -> Result<PathBuf, RemoteError> {
        if !self.root.is_dir() {
            return Err(RemoteError::Unreachable(format!(
                "{} is not mounted",
                self.root.display()
            )));
        }
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| RemoteError::Io(dir.clone(), e))?;
        Ok(dir)
    }

    fn document(&self, collection: &str, identity_id: &str) -> Result<PathBuf, RemoteError> {
        Ok(self.collection(collection)?.join(format!("{}.json", hex_key(identity_id))))
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), RemoteError> {
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| RemoteError::Codec(path.display().to_string(), e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| RemoteError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, path).map_err(|e| RemoteError::Io(path.to_path_buf(), e))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, RemoteError> {
        match std::fs::read(path) {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| RemoteError::Codec(path.display().to_string(), e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::Io(path.to_path_buf(), e)),
        }
    }

    fn delete(&self, path: &Path) -> Result<(), RemoteError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::Io(path.to_path_buf(), e)),
        }
    }
}

impl RemoteStore for DirectoryRemote {
    fn push_embedding(&mut self, embedding: &Embedding) -> Result<(), RemoteError> {
        let path = self.document(EMBEDDINGS_DIR, &embedding.identity_id)?;
        self.write(&path, embedding)
    }

    fn pull_embedding(&mut self, identity_id: &str) -> Result<Option<Embedding>, RemoteError> {
        let path = self.document(EMBEDDINGS_DIR, identity_id)?;
        self.read(&path)
    }

    fn delete_embedding(&mut self, identity_id: &str) -> Result<(), RemoteError> {
        let path = self.document(EMBEDDINGS_DIR, identity_id)?;
        self.delete(&path)
    }

    fn push_record(&mut self, record: &RegistryRecord) -> Result<(), RemoteError> {
        let path = self.document(REGISTRY_DIR, &record.identity_id)?;
        self.write(&path, record)
    }

    fn pull_records(&mut self) -> Result<HashMap<String, RegistryRecord>, RemoteError> {
        let dir = self.collection(REGISTRY_DIR)?;
        let entries = std::fs::read_dir(&dir).map_err(|e| RemoteError::Io(dir.clone(), e))?;

        let mut records = HashMap::new();
        for entry in entries {
            let path = entry.map_err(|e| RemoteError::Io(dir.clone(), e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read::<RegistryRecord>(&path)? {
                records.insert(record.identity_id.clone(), record);
            }
        }
        Ok(records)
    }

    fn delete_record(&mut self, identity_id: &str) -> Result<(), RemoteError> {
        let path = self.document(REGISTRY_DIR, identity_id)?;
        self.delete(&path)
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.root.display())
    }
}

/// Lowercase hex of the UTF-8 bytes, so any identity is a safe file name.
fn hex_key(identity_id: &str) -> String {
    identity_id.bytes().map(|b| format!("{b:02x}")).collect()
}

#[derive(Default)]
struct MemoryRemoteState {
    embeddings: HashMap<String, Embedding>,
    records: HashMap<String, RegistryRecord>,
    unreachable: bool,
    fail_deletes: bool,
}

/// In-process remote tier.
///
/// Clones share state, so a test can keep one handle to inspect or break
/// the remote while the replication worker owns another.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryRemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make delete calls fail while pushes and pulls keep working.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn embedding(&self, identity_id: &str) -> Option<Embedding> {
        self.lock().embeddings.get(identity_id).cloned()
    }

    pub fn record(&self, identity_id: &str) -> Option<RegistryRecord> {
        self.lock().records.get(identity_id).cloned()
    }

    /// Seed a record directly, bypassing replication.
    pub fn insert_record(&self, record: RegistryRecord) {
        self.lock().records.insert(record.identity_id.clone(), record);
    }

    /// Drop a record directly, as another device's delete would.
    pub fn remove_record(&self, identity_id: &str) {
        self.lock().records.remove(identity_id);
    }

    /// Seed an embedding directly, bypassing replication.
    pub fn insert_embedding(&self, embedding: Embedding) {
        self.lock()
            .embeddings
            .insert(embedding.identity_id.clone(), embedding);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reachable(&self) -> Result<MutexGuard<'_, MemoryRemoteState>, RemoteError> {
        let state = self.lock();
        if state.unreachable {
            return Err(RemoteError::Unreachable("memory remote offline".into()));
        }
        Ok(state)
    }

    fn deletable(&self) -> Result<MutexGuard<'_, MemoryRemoteState>, RemoteError> {
        let state = self.reachable()?;
        if state.fail_deletes {
            return Err(RemoteError::Unreachable("memory remote rejected delete".into()));
        }
        Ok(state)
    }
}

impl RemoteStore for MemoryRemote {
    fn push_embedding(&mut self, embedding: &Embedding) -> Result<(), RemoteError> {
        self.reachable()?
            .embeddings
            .insert(embedding.identity_id.clone(), embedding.clone());
        Ok(())
    }

    fn pull_embedding(&mut self, identity_id: &str) -> Result<Option<Embedding>, RemoteError> {
        Ok(self.reachable()?.embeddings.get(identity_id).cloned())
    }

    fn delete_embedding(&mut self, identity_id: &str) -> Result<(), RemoteError> {
        self.deletable()?.embeddings.remove(identity_id);
        Ok(())
    }

    fn push_record(&mut self, record: &RegistryRecord) -> Result<(), RemoteError> {
        self.reachable()?
            .records
            .insert(record.identity_id.clone(), record.clone());
        Ok(())
    }

    fn pull_records(&mut self) -> Result<HashMap<String, RegistryRecord>, RemoteError> {
        Ok(self.reachable()?.records.clone())
    }

    fn delete_record(&mut self, identity_id: &str) -> Result<(), RemoteError> {
        self.deletable()?.records.remove(identity_id);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
