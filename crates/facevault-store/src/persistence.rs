//! Local durable tier with a silent in-memory fallback.
//!
//! Three independent namespaces share one SQLite file. Writes the durable
//! backend did not accept are kept in a per-namespace mirror, so a namespace
//! whose backend fails (at open time or on any later call) keeps answering
//! consistently for the rest of the process.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create storage directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to open database {0}: {1}")]
    Open(PathBuf, rusqlite::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Logical partition of the local tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Embeddings,
    Registry,
    Session,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Embeddings, Namespace::Registry, Namespace::Session];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Embeddings => "embeddings",
            Namespace::Registry => "registry",
            Namespace::Session => "session",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable key/value storage for JSON documents.
pub trait DurableBackend: Send + Sync {
    /// Make `namespace` ready for use. Called once per namespace at startup.
    fn prepare(&self, _namespace: Namespace) -> Result<(), StorageError> {
        Ok(())
    }

    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, namespace: Namespace, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, namespace: Namespace, key: &str) -> Result<(), StorageError>;
}

/// SQLite implementation of [`DurableBackend`], one table per namespace.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::CreateDir(parent.to_path_buf(), e))?;
        }
        let conn = Connection::open(path).map_err(|e| StorageError::Open(path.to_path_buf(), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::info!(path = %path.display(), "opened local database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableBackend for SqliteBackend {
    fn prepare(&self, namespace: Namespace) -> Result<(), StorageError> {
        self.lock().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ns} (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
            ns = namespace.as_str()
        ))?;
        Ok(())
    }

    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .lock()
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", namespace.as_str()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, namespace: Namespace, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().execute(
            &format!(
                "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                namespace.as_str()
            ),
            params![key, value, facevault_core::now_millis()],
        )?;
        Ok(())
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<(), StorageError> {
        self.lock().execute(
            &format!("DELETE FROM {} WHERE key = ?1", namespace.as_str()),
            params![key],
        )?;
        Ok(())
    }
}

/// Where a namespace keeps its data.
#[derive(Clone)]
pub enum StorageBackend {
    Durable(Arc<dyn DurableBackend>),
    InMemory,
}

/// Reported kind of a namespace's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Durable,
    InMemory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Durable => "durable",
            BackendKind::InMemory => "in-memory",
        }
    }
}

struct Slot {
    namespace: Namespace,
    backend: StorageBackend,
    /// Writes durable storage has not accepted: `Some(json)` for a set,
    /// `None` for a remove.
    mirror: Mutex<HashMap<String, Option<String>>>,
    fallback_logged: AtomicBool,
}

impl Slot {
    fn new(namespace: Namespace, backend: StorageBackend) -> Self {
        Self {
            namespace,
            backend,
            mirror: Mutex::new(HashMap::new()),
            fallback_logged: AtomicBool::new(false),
        }
    }

    fn mirror(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.mirror.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the mirrored `written` value once durable storage holds it,
    /// unless a newer write replaced it meanwhile.
    fn settle(&self, key: &str, written: &Option<String>) {
        let mut mirror = self.mirror();
        if mirror.get(key) == Some(written) {
            mirror.remove(key);
        }
    }

    fn note_failure(&self, op: &'static str, err: &StorageError) {
        if !self.fallback_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                namespace = %self.namespace,
                op,
                error = %err,
                "durable storage failed; serving from in-memory fallback"
            );
        } else {
            tracing::debug!(namespace = %self.namespace, op, error = %err, "durable storage failed");
        }
    }
}

/// The Persistence Adapter: `get`/`set`/`remove` over three namespaces.
///
/// No method returns an error. Durable failures are logged and absorbed.
pub struct Persistence {
    slots: [Slot; 3],
}

impl Persistence {
    /// Open the SQLite file at `path`, falling back to memory if that fails.
    pub fn open(path: &Path) -> Self {
        match SqliteBackend::open(path) {
            Ok(backend) => Self::with_backend(Arc::new(backend)),
            Err(err) => {
                for ns in Namespace::ALL {
                    tracing::warn!(
                        namespace = %ns,
                        path = %path.display(),
                        error = %err,
                        "durable storage unavailable; using in-memory fallback"
                    );
                }
                Self::in_memory()
            }
        }
    }

    /// Process-local storage only.
    pub fn in_memory() -> Self {
        Self {
            slots: Namespace::ALL.map(|ns| Slot::new(ns, StorageBackend::InMemory)),
        }
    }

    /// Use `backend` for every namespace whose `prepare` succeeds.
    pub fn with_backend(backend: Arc<dyn DurableBackend>) -> Self {
        let slots = Namespace::ALL.map(|ns| match backend.prepare(ns) {
            Ok(()) => Slot::new(ns, StorageBackend::Durable(Arc::clone(&backend))),
            Err(err) => {
                tracing::warn!(
                    namespace = %ns,
                    error = %err,
                    "durable storage init failed; using in-memory fallback"
                );
                let slot = Slot::new(ns, StorageBackend::InMemory);
                slot.fallback_logged.store(true, Ordering::Relaxed);
                slot
            }
        });
        Self { slots }
    }

    pub fn backend_kind(&self, namespace: Namespace) -> BackendKind {
        match self.slot(namespace).backend {
            StorageBackend::Durable(_) => BackendKind::Durable,
            StorageBackend::InMemory => BackendKind::InMemory,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let raw = self.get_raw(namespace, key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(namespace = %namespace, key, error = %err, "discarding undecodable stored value");
                None
            }
        }
    }

    /// Store `value`. Returns `true` iff it reached durable storage.
    pub fn set<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(namespace = %namespace, key, error = %err, "value could not be encoded; not stored");
                return false;
            }
        };
        let slot = self.slot(namespace);
        slot.mirror().insert(key.to_string(), Some(raw.clone()));
        let durable = self.dispatch(slot, "set", |backend| backend.set(namespace, key, &raw));
        if durable {
            slot.settle(key, &Some(raw));
        }
        durable
    }

    /// Remove `key`. Returns `true` iff the removal reached durable storage.
    pub fn remove(&self, namespace: Namespace, key: &str) -> bool {
        let slot = self.slot(namespace);
        slot.mirror().insert(key.to_string(), None);
        let durable = self.dispatch(slot, "remove", |backend| backend.remove(namespace, key));
        if durable {
            slot.settle(key, &None);
        }
        durable
    }

    fn get_raw(&self, namespace: Namespace, key: &str) -> Option<String> {
        let slot = self.slot(namespace);
        if let Some(entry) = slot.mirror().get(key) {
            return entry.clone();
        }
        match &slot.backend {
            StorageBackend::InMemory => None,
            StorageBackend::Durable(backend) => match backend.get(namespace, key) {
                Ok(value) => value,
                Err(err) => {
                    slot.note_failure("get", &err);
                    None
                }
            },
        }
    }

    /// Try the durable backend; the mirror already holds the write.
    fn dispatch(
        &self,
        slot: &Slot,
        op: &'static str,
        action: impl FnOnce(&dyn DurableBackend) -> Result<(), StorageError>,
    ) -> bool {
        match &slot.backend {
            StorageBackend::InMemory => false,
            StorageBackend::Durable(backend) => match action(backend.as_ref()) {
                Ok(()) => true,
                Err(err) => {
                    slot.note_failure(op, &err);
                    false
                }
            },
        }
    }

    fn slot(&self, namespace: Namespace) -> &Slot {
        &self.slots[namespace.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    /// Backend that fails every call, optionally including `prepare`.
    struct BrokenBackend {
        fail_prepare: bool,
    }

    impl DurableBackend for BrokenBackend {
        fn prepare(&self, _namespace: Namespace) -> Result<(), StorageError> {
            if self.fail_prepare {
                Err(StorageError::Unavailable("storage disabled".into()))
            } else {
                Ok(())
            }
        }

        fn get(&self, _: Namespace, _: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("read refused".into()))
        }

        fn set(&self, _: Namespace, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("write refused".into()))
        }

        fn remove(&self, _: Namespace, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("remove refused".into()))
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        n: u32,
    }

    fn doc(name: &str, n: u32) -> Doc {
        Doc { name: name.into(), n }
    }

    #[test]
    fn test_sqlite_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/biometrics.db");

        let first = Persistence::open(&path);
        assert_eq!(first.backend_kind(Namespace::Embeddings), BackendKind::Durable);
        assert!(first.set(Namespace::Embeddings, "u1", &doc("a", 1)));
        assert!(first.set(Namespace::Registry, "u1", &doc("b", 2)));
        drop(first);

        let second = Persistence::open(&path);
        assert_eq!(second.get::<Doc>(Namespace::Embeddings, "u1"), Some(doc("a", 1)));
        assert_eq!(second.get::<Doc>(Namespace::Registry, "u1"), Some(doc("b", 2)));
        assert_eq!(second.get::<Doc>(Namespace::Session, "u1"), None);
    }

    #[test]
    fn test_namespaces_are_independent() {
        let store = Persistence::with_backend(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        store.set(Namespace::Embeddings, "k", &doc("emb", 1));
        store.set(Namespace::Session, "k", &doc("ses", 2));
        store.remove(Namespace::Embeddings, "k");

        assert_eq!(store.get::<Doc>(Namespace::Embeddings, "k"), None);
        assert_eq!(store.get::<Doc>(Namespace::Session, "k"), Some(doc("ses", 2)));
    }

    #[test]
    fn test_unopenable_path_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let store = Persistence::open(&blocker.join("biometrics.db"));
        for ns in Namespace::ALL {
            assert_eq!(store.backend_kind(ns), BackendKind::InMemory);
        }
        assert!(!store.set(Namespace::Registry, "users", &doc("r", 1)));
        assert_eq!(store.get::<Doc>(Namespace::Registry, "users"), Some(doc("r", 1)));
    }

    #[test]
    fn test_failed_prepare_demotes_namespace() {
        let store = Persistence::with_backend(Arc::new(BrokenBackend { fail_prepare: true }));
        assert_eq!(store.backend_kind(Namespace::Session), BackendKind::InMemory);
        store.set(Namespace::Session, "offline-session", &doc("s", 9));
        assert_eq!(store.get::<Doc>(Namespace::Session, "offline-session"), Some(doc("s", 9)));
    }

    #[test]
    fn test_failing_operations_served_from_mirror() {
        let store = Persistence::with_backend(Arc::new(BrokenBackend { fail_prepare: false }));
        assert_eq!(store.backend_kind(Namespace::Embeddings), BackendKind::Durable);

        assert_eq!(store.get::<Doc>(Namespace::Embeddings, "missing"), None);
        assert!(!store.set(Namespace::Embeddings, "u1", &doc("a", 1)));
        assert_eq!(store.get::<Doc>(Namespace::Embeddings, "u1"), Some(doc("a", 1)));

        assert!(!store.remove(Namespace::Embeddings, "u1"));
        assert_eq!(store.get::<Doc>(Namespace::Embeddings, "u1"), None);
    }

    #[test]
    fn test_mirror_only_holds_unaccepted_writes() {
        let store = Persistence::with_backend(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        assert!(store.set(Namespace::Embeddings, "u1", &doc("a", 1)));
        assert!(store.remove(Namespace::Embeddings, "u2"));
        assert!(store.slot(Namespace::Embeddings).mirror().is_empty());
        assert_eq!(store.get::<Doc>(Namespace::Embeddings, "u1"), Some(doc("a", 1)));

        let broken = Persistence::with_backend(Arc::new(BrokenBackend { fail_prepare: false }));
        broken.set(Namespace::Embeddings, "u1", &doc("a", 1));
        broken.remove(Namespace::Embeddings, "u2");
        assert_eq!(broken.slot(Namespace::Embeddings).mirror().len(), 2);
    }

    #[test]
    fn test_in_memory_namespace_keeps_its_values() {
        let store = Persistence::in_memory();
        store.set(Namespace::Session, "k", &doc("first", 1));
        assert_eq!(store.slot(Namespace::Session).mirror().len(), 1);
        assert_eq!(store.get::<Doc>(Namespace::Session, "k"), Some(doc("first", 1)));
    }

    #[test]
    fn test_undecodable_value_reads_as_absent() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        backend.prepare(Namespace::Registry).unwrap();
        backend.set(Namespace::Registry, "users", "{not json").unwrap();

        let store = Persistence::with_backend(backend);
        assert_eq!(store.get::<Doc>(Namespace::Registry, "users"), None);
    }
}
