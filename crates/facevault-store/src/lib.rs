//! facevault-store — Offline-first biometric identity store.
//!
//! Keeps face embeddings, the identity registry and the offline session in
//! a local durable tier (SQLite, with an in-memory fallback) and replicates
//! writes to an optional remote tier on a background worker. Storage and
//! network failures are logged and absorbed; callers only ever see values.

pub mod auth;
pub mod config;
pub mod embeddings;
pub mod persistence;
pub mod registry;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync;

pub use auth::{AuthOutcome, ResumedSession};
pub use config::{ConfigError, StoreConfig};
pub use embeddings::EmbeddingStore;
pub use persistence::{
    BackendKind, DurableBackend, Namespace, Persistence, SqliteBackend, StorageBackend,
    StorageError,
};
pub use registry::{RegistryManager, Tombstone};
pub use remote::{DirectoryRemote, MemoryRemote, RemoteError, RemoteStore};
pub use session::SessionManager;
pub use store::{BiometricStore, StoreStatus};
pub use sync::{spawn_replicator, FailedSync, ReplicatorHandle, SyncOp, SyncTask, MAX_FAILED};
