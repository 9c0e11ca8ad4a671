//! The store context: one object built at startup and shared by reference.

use crate::config::StoreConfig;
use crate::embeddings::EmbeddingStore;
use crate::persistence::{Namespace, Persistence};
use crate::registry::RegistryManager;
use crate::remote::{DirectoryRemote, RemoteStore};
use crate::session::SessionManager;
use crate::sync::{spawn_replicator, ReplicatorHandle};
use facevault_core::{
    compare_descriptors, Descriptor, Embedding, MatchResult, OfflineSession, RegistryPatch,
    RegistryRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Snapshot of backend and replication health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Backend kind per namespace (`durable` or `in-memory`).
    pub backends: BTreeMap<&'static str, &'static str>,
    pub remote: Option<String>,
    pub pending_sync: usize,
    pub failed_sync: usize,
    pub completed_sync: u64,
    pub match_threshold: f32,
}

/// Offline-first biometric identity store.
///
/// Cheap to clone; clones share the same local tier and replication worker.
#[derive(Clone)]
pub struct BiometricStore {
    local: Arc<Persistence>,
    sync: ReplicatorHandle,
    registry: RegistryManager,
    embeddings: EmbeddingStore,
    sessions: SessionManager,
    match_threshold: f32,
}

impl BiometricStore {
    /// Build the store from configuration. Never fails: an unusable database
    /// falls back to memory and an unusable remote disables replication.
    pub fn open(config: &StoreConfig) -> Self {
        let local = match &config.db_path {
            Some(path) => Persistence::open(path),
            None => Persistence::in_memory(),
        };
        let sync = match &config.remote_dir {
            Some(dir) => start_replicator(DirectoryRemote::new(dir)),
            None => ReplicatorHandle::disabled(),
        };
        Self::from_parts(Arc::new(local), sync, config.match_threshold)
    }

    /// Store over `local`, replicating to `remote`.
    pub fn with_remote<R: RemoteStore>(local: Persistence, remote: R, match_threshold: f32) -> Self {
        Self::from_parts(Arc::new(local), start_replicator(remote), match_threshold)
    }

    pub fn from_parts(local: Arc<Persistence>, sync: ReplicatorHandle, match_threshold: f32) -> Self {
        let registry = RegistryManager::new(Arc::clone(&local), sync.clone());
        let embeddings = EmbeddingStore::new(Arc::clone(&local), sync.clone(), registry.clone());
        let sessions = SessionManager::new(Arc::clone(&local));
        Self {
            local,
            sync,
            registry,
            embeddings,
            sessions,
            match_threshold,
        }
    }

    pub fn save_embedding(&self, embedding: &Embedding) {
        self.embeddings.save(embedding);
    }

    pub async fn get_embedding(&self, identity_id: &str) -> Option<Embedding> {
        self.embeddings.get(identity_id).await
    }

    pub fn delete_user_record(&self, identity_id: &str) {
        self.embeddings.delete(identity_id);
    }

    pub fn update_registry(&self, patch: &RegistryPatch) -> Option<RegistryRecord> {
        self.registry.upsert(patch)
    }

    pub async fn list_registered_users(&self) -> Vec<RegistryRecord> {
        self.registry.list_all().await
    }

    pub fn set_offline_session(&self, session: &OfflineSession) {
        self.sessions.set(session);
    }

    pub fn get_offline_session(&self) -> Option<OfflineSession> {
        self.sessions.get()
    }

    pub fn clear_offline_session(&self) {
        self.sessions.clear();
    }

    /// Compare with `threshold`, or the configured threshold when `None`.
    pub fn compare_descriptors(
        &self,
        stored: &Descriptor,
        live: &Descriptor,
        threshold: Option<f32>,
    ) -> MatchResult {
        compare_descriptors(stored, live, threshold.unwrap_or(self.match_threshold))
    }

    pub fn match_threshold(&self) -> f32 {
        self.match_threshold
    }

    pub fn registry(&self) -> &RegistryManager {
        &self.registry
    }

    pub fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sync(&self) -> &ReplicatorHandle {
        &self.sync
    }

    /// Wait for every queued replication task to be attempted.
    pub async fn flush(&self) {
        self.sync.flush().await;
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            backends: Namespace::ALL
                .iter()
                .map(|&ns| (ns.as_str(), self.local.backend_kind(ns).as_str()))
                .collect(),
            remote: self.sync.remote().map(str::to_string),
            pending_sync: self.sync.pending().len(),
            failed_sync: self.sync.failed().len(),
            completed_sync: self.sync.completed(),
            match_threshold: self.match_threshold,
        }
    }
}

fn start_replicator<R: RemoteStore>(remote: R) -> ReplicatorHandle {
    match spawn_replicator(remote) {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(error = %err, "failed to start replication worker; remote tier disabled");
            ReplicatorHandle::disabled()
        }
    }
}
