//! Embedding Store: per-identity descriptors, read-through and write-through.

use crate::persistence::{Namespace, Persistence};
use crate::registry::RegistryManager;
use crate::remote::RemoteError;
use crate::sync::{ReplicatorHandle, SyncOp};
use facevault_core::Embedding;
use std::sync::Arc;

#[derive(Clone)]
pub struct EmbeddingStore {
    local: Arc<Persistence>,
    sync: ReplicatorHandle,
    registry: RegistryManager,
}

impl EmbeddingStore {
    pub fn new(local: Arc<Persistence>, sync: ReplicatorHandle, registry: RegistryManager) -> Self {
        Self {
            local,
            sync,
            registry,
        }
    }

    /// Store `embedding` locally, queue it for the remote tier and flag the
    /// identity as enrolled. Each step runs even if an earlier one degraded.
    pub fn save(&self, embedding: &Embedding) {
        let id = embedding.identity_id.as_str();
        let durable = self.local.set(Namespace::Embeddings, id, embedding);
        self.sync.enqueue(SyncOp::PushEmbedding(embedding.clone()));
        self.registry.settle_embedding(id);
        let record = self.registry.mark_enrolled(id, embedding.updated_at);

        tracing::info!(
            identity = id,
            durable,
            registry_updated_at = ?record.map(|r| r.updated_at),
            "embedding saved"
        );
    }

    /// Local tier first; on a miss, the remote tier, warming the local tier
    /// with whatever it returns.
    pub async fn get(&self, identity_id: &str) -> Option<Embedding> {
        if let Some(embedding) = self.local.get::<Embedding>(Namespace::Embeddings, identity_id) {
            return Some(embedding);
        }

        tracing::debug!(identity = identity_id, "embedding not cached locally; asking remote");
        let embedding = match self.sync.pull_embedding(identity_id).await {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                self.registry.settle_embedding(identity_id);
                return None;
            }
            Err(RemoteError::Disabled) => return None,
            Err(err) => {
                tracing::warn!(identity = identity_id, error = %err, "remote embedding fetch failed");
                return None;
            }
        };

        if embedding.identity_id != identity_id {
            tracing::warn!(
                identity = identity_id,
                stored_as = %embedding.identity_id,
                "remote returned an embedding for a different identity; ignoring"
            );
            return None;
        }
        if let Some(deleted_at) = self.registry.embedding_deleted_at(identity_id) {
            if embedding.updated_at <= deleted_at {
                tracing::debug!(identity = identity_id, "remote embedding predates local deletion; ignoring");
                return None;
            }
            self.registry.settle_embedding(identity_id);
        }

        self.local.set(Namespace::Embeddings, identity_id, &embedding);
        Some(embedding)
    }

    /// Remove the embedding and registry record locally, then queue both
    /// remote deletions. Local removal is immediate; remote is eventual.
    pub fn delete(&self, identity_id: &str) {
        self.local.remove(Namespace::Embeddings, identity_id);
        let deleted_at = self.registry.remove_local(identity_id);
        self.sync.enqueue(SyncOp::DeleteEmbedding(identity_id.to_string()));
        self.sync.enqueue(SyncOp::DeleteRecord(identity_id.to_string()));
        tracing::info!(identity = identity_id, deleted_at, "user record deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::sync::spawn_replicator;
    use facevault_core::{Descriptor, RegistryPatch, DESCRIPTOR_LEN};

    fn embedding(id: &str, fill: f32, at: i64) -> Embedding {
        Embedding {
            identity_id: id.into(),
            descriptor: Descriptor::new(vec![fill; DESCRIPTOR_LEN]).unwrap(),
            updated_at: at,
        }
    }

    fn store_with(remote: &MemoryRemote) -> EmbeddingStore {
        let local = Arc::new(Persistence::in_memory());
        let sync = spawn_replicator(remote.clone()).unwrap();
        let registry = RegistryManager::new(Arc::clone(&local), sync.clone());
        EmbeddingStore::new(local, sync, registry)
    }

    #[tokio::test]
    async fn test_save_enrolls_and_replicates() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        let e = embedding("u1", 0.1, 1_000);

        store.save(&e);
        assert_eq!(store.get("u1").await, Some(e.clone()));

        let record = store.registry.get("u1").unwrap();
        assert!(record.enrolled);
        assert_eq!(record.updated_at, 1_000);

        store.sync.flush().await;
        assert_eq!(remote.embedding("u1"), Some(e));
        assert!(remote.record("u1").is_some_and(|r| r.enrolled));
    }

    #[tokio::test]
    async fn test_save_enrolls_even_when_registry_is_newer() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        store.registry.upsert(&RegistryPatch::new("u1").updated_at(5_000));

        store.save(&embedding("u1", 0.1, 4_000));
        let record = store.registry.get("u1").unwrap();
        assert!(record.enrolled);
        assert!(record.updated_at > 5_000);
    }

    #[tokio::test]
    async fn test_remote_hit_warms_local_tier() {
        let remote = MemoryRemote::new();
        let e = embedding("u2", 0.3, 7);
        remote.insert_embedding(e.clone());
        let store = store_with(&remote);

        assert_eq!(store.get("u2").await, Some(e.clone()));

        remote.set_unreachable(true);
        assert_eq!(store.get("u2").await, Some(e));
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_absent() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        assert_eq!(store.get("nobody").await, None);

        remote.set_unreachable(true);
        assert_eq!(store.get("nobody").await, None);
    }

    #[tokio::test]
    async fn test_delete_is_locally_immediate_when_remote_fails() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        store.save(&embedding("u1", 0.2, 10));
        store.sync.flush().await;

        remote.set_fail_deletes(true);
        store.delete("u1");
        store.sync.flush().await;

        assert_eq!(store.get("u1").await, None);
        assert!(store.registry.list_all().await.is_empty());
        assert!(remote.embedding("u1").is_some());
        assert_eq!(store.sync.failed().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_remote_pull_settles_deletion() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        store.save(&embedding("u1", 0.2, 10));
        store.delete("u1");
        store.sync.flush().await;
        assert!(store.registry.embedding_deleted_at("u1").is_some());

        assert_eq!(store.get("u1").await, None);
        assert_eq!(store.registry.embedding_deleted_at("u1"), None);
    }

    #[tokio::test]
    async fn test_stale_remote_embedding_stays_hidden_after_listing() {
        let remote = MemoryRemote::new();
        let store = store_with(&remote);
        store.save(&embedding("u1", 0.2, 10));
        store.sync.flush().await;

        store.delete("u1");
        store.sync.flush().await;
        // Registry delete landed remotely; the embedding copy survived.
        remote.insert_embedding(embedding("u1", 0.2, 10));
        assert!(remote.record("u1").is_none());

        assert!(store.registry.list_all().await.is_empty());
        assert_eq!(store.get("u1").await, None);
        assert!(store.registry.embedding_deleted_at("u1").is_some());
    }
}
