//! Registry Manager: identity → account metadata and enrollment flag.
//!
//! The local registry is one aggregate document (`"users"`). Conflicts are
//! resolved per whole record by `updated_at` (last write wins). Concurrent
//! edits to different fields of the same record are not merged.

use crate::persistence::{Namespace, Persistence};
use crate::remote::RemoteError;
use crate::sync::{ReplicatorHandle, SyncOp};
use facevault_core::{now_millis, RegistryPatch, RegistryRecord, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Key of the aggregate registry document.
pub const USERS_KEY: &str = "users";
/// Key of the deletion tombstones document.
pub const TOMBSTONES_KEY: &str = "tombstones";

type RegistryMap = BTreeMap<String, RegistryRecord>;
type Tombstones = BTreeMap<String, Tombstone>;

/// Local deletion of an identity whose remote copies may still exist.
///
/// Each flag is cleared independently once the remote tier is seen without
/// that copy (or the copy is superseded by a newer local write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub deleted_at: Timestamp,
    /// The remote registry may still hold the record.
    pub record: bool,
    /// The remote tier may still hold the embedding.
    pub embedding: bool,
}

impl Tombstone {
    fn is_settled(&self) -> bool {
        !self.record && !self.embedding
    }
}

/// How a registry write picks its `updated_at`.
enum Stamp {
    /// Caller-supplied; loses to anything newer, raised on a tie.
    Exact(Timestamp),
    /// Caller-supplied, raised if needed so the write always lands.
    AtLeast(Timestamp),
    Now,
}

/// Bookkeeping for local writes, guarded by the write lock.
#[derive(Default)]
struct WriteState {
    generation: u64,
    /// Generation of the last local write per identity.
    written: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct RegistryManager {
    local: Arc<Persistence>,
    sync: ReplicatorHandle,
    /// Serializes read-modify-write of the aggregate document.
    write_lock: Arc<Mutex<WriteState>>,
}

impl RegistryManager {
    pub fn new(local: Arc<Persistence>, sync: ReplicatorHandle) -> Self {
        Self {
            local,
            sync,
            write_lock: Arc::default(),
        }
    }

    pub fn get(&self, identity_id: &str) -> Option<RegistryRecord> {
        self.load_users().remove(identity_id)
    }

    /// Merge `patch` onto the stored record (or a fresh one) and stamp it.
    ///
    /// An explicit `patch.updated_at` older than the stored record or its
    /// deletion is ignored; one equal to the stored stamp applies with the
    /// stamp raised by one. Without one the new stamp is strictly greater
    /// than both. Returns the record visible after the call.
    pub fn upsert(&self, patch: &RegistryPatch) -> Option<RegistryRecord> {
        let stamp = patch.updated_at.map_or(Stamp::Now, Stamp::Exact);
        self.write(patch, stamp)
    }

    /// Flag `identity_id` as enrolled, stamped `at` unless the stored record
    /// is already that fresh, in which case the flag still lands with a
    /// newer stamp.
    pub(crate) fn mark_enrolled(&self, identity_id: &str, at: Timestamp) -> Option<RegistryRecord> {
        self.write(&RegistryPatch::new(identity_id).enrolled(true), Stamp::AtLeast(at))
    }

    fn write(&self, patch: &RegistryPatch, stamp: Stamp) -> Option<RegistryRecord> {
        let mut state = self.lock();
        let mut users = self.load_users();
        let mut tombstones = self.load_tombstones();
        let id = patch.identity_id.as_str();
        let existing = users.get(id);
        let deleted_at = tombstones.get(id).map(|t| t.deleted_at);
        let floor = existing
            .map(|r| r.updated_at)
            .into_iter()
            .chain(deleted_at)
            .max()
            .map_or(Timestamp::MIN, |t| t.saturating_add(1));

        let stamp = match stamp {
            Stamp::Exact(at) => {
                if let Some(current) = existing.filter(|r| at < r.updated_at) {
                    tracing::debug!(identity = id, at, current = current.updated_at, "stale registry write ignored");
                    return Some(current.clone());
                }
                if deleted_at.is_some_and(|d| at <= d) {
                    tracing::debug!(identity = id, at, "registry write older than deletion ignored");
                    return None;
                }
                at.max(floor)
            }
            Stamp::AtLeast(at) => at.max(floor),
            Stamp::Now => now_millis().max(floor),
        };

        let mut record = existing
            .cloned()
            .unwrap_or_else(|| RegistryRecord::new(id, stamp));
        record.apply(patch);
        record.updated_at = stamp;

        users.insert(id.to_string(), record.clone());
        self.local.set(Namespace::Registry, USERS_KEY, &users);
        if let Some(tombstone) = tombstones.get_mut(id).filter(|t| t.record) {
            tombstone.record = false;
            if tombstone.is_settled() {
                tombstones.remove(id);
            }
            self.local.set(Namespace::Registry, TOMBSTONES_KEY, &tombstones);
        }
        state.generation += 1;
        let generation = state.generation;
        state.written.insert(id.to_string(), generation);
        tracing::debug!(identity = id, updated_at = stamp, enrolled = record.enrolled, "registry updated");

        self.sync.enqueue(SyncOp::PushRecord(record.clone()));
        Some(record)
    }

    /// Every known record, newest first; ties by identity ascending.
    ///
    /// A successful remote listing replaces the local registry (minus
    /// identities deleted here more recently, plus records written here
    /// while the listing was in flight). Otherwise the local registry is
    /// returned as is.
    pub async fn list_all(&self) -> Vec<RegistryRecord> {
        let since = self.lock().generation;
        match self.sync.pull_records().await {
            Ok(remote) => self.adopt_remote(remote, since),
            Err(RemoteError::Disabled) => {
                self.prune_tombstones();
                sorted(self.load_users().into_values().collect())
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote registry unreachable; listing local registry");
                sorted(self.load_users().into_values().collect())
            }
        }
    }

    pub fn tombstone(&self, identity_id: &str) -> Option<Tombstone> {
        self.load_tombstones().get(identity_id).copied()
    }

    /// Deletion time of `identity_id` while its remote embedding may survive.
    pub(crate) fn embedding_deleted_at(&self, identity_id: &str) -> Option<Timestamp> {
        self.tombstone(identity_id)
            .filter(|t| t.embedding)
            .map(|t| t.deleted_at)
    }

    /// The remote tier no longer holds a stale embedding for `identity_id`.
    pub(crate) fn settle_embedding(&self, identity_id: &str) {
        let _state = self.lock();
        let mut tombstones = self.load_tombstones();
        let Some(tombstone) = tombstones.get_mut(identity_id).filter(|t| t.embedding) else {
            return;
        };
        tombstone.embedding = false;
        if tombstone.is_settled() {
            tombstones.remove(identity_id);
        }
        self.local.set(Namespace::Registry, TOMBSTONES_KEY, &tombstones);
        tracing::debug!(identity = identity_id, "embedding deletion settled");
    }

    /// Drop the local record and, when a remote tier exists, leave a
    /// tombstone covering both remote copies. Returns the deletion stamp.
    pub(crate) fn remove_local(&self, identity_id: &str) -> Timestamp {
        let mut state = self.lock();
        let mut users = self.load_users();
        let mut tombstones = self.load_tombstones();

        let floor = users
            .remove(identity_id)
            .map_or(Timestamp::MIN, |r| r.updated_at.saturating_add(1));
        let deleted_at = now_millis().max(floor);
        state.written.remove(identity_id);

        self.local.set(Namespace::Registry, USERS_KEY, &users);
        if self.sync.is_enabled() {
            tombstones.insert(
                identity_id.to_string(),
                Tombstone {
                    deleted_at,
                    record: true,
                    embedding: true,
                },
            );
            self.local.set(Namespace::Registry, TOMBSTONES_KEY, &tombstones);
        } else if tombstones.remove(identity_id).is_some() {
            self.local.set(Namespace::Registry, TOMBSTONES_KEY, &tombstones);
        }
        deleted_at
    }

    /// Replace the local registry with `remote`, keeping records written
    /// locally after generation `since` unless the remote copy is newer.
    fn adopt_remote(&self, remote: HashMap<String, RegistryRecord>, since: u64) -> Vec<RegistryRecord> {
        let state = self.lock();
        let local = self.load_users();
        let mut tombstones = self.load_tombstones();
        let before = tombstones.clone();
        let mut users = RegistryMap::new();
        let mut stale = HashSet::new();

        for (id, record) in remote {
            if let Some(tombstone) = tombstones.get(&id).filter(|t| t.record) {
                if record.updated_at <= tombstone.deleted_at {
                    tracing::debug!(identity = %id, "remote still holds a locally deleted record");
                    stale.insert(id);
                    continue;
                }
            }
            users.insert(id, record);
        }

        // Only the record copy is settled here; the embedding flag waits for
        // an embedding pull that comes back empty.
        for (id, tombstone) in tombstones.iter_mut() {
            if !stale.contains(id) {
                tombstone.record = false;
            }
        }
        tombstones.retain(|_, t| !t.is_settled());

        for (id, &generation) in &state.written {
            if generation <= since {
                continue;
            }
            let Some(record) = local.get(id) else {
                continue;
            };
            if users.get(id).map_or(true, |r| r.updated_at <= record.updated_at) {
                tracing::debug!(identity = %id, "keeping registry write made during listing");
                users.insert(id.clone(), record.clone());
            }
        }

        self.local.set(Namespace::Registry, USERS_KEY, &users);
        if tombstones != before {
            self.local.set(Namespace::Registry, TOMBSTONES_KEY, &tombstones);
        }
        sorted(users.into_values().collect())
    }

    fn prune_tombstones(&self) {
        let _state = self.lock();
        if !self.load_tombstones().is_empty() {
            self.local.set(Namespace::Registry, TOMBSTONES_KEY, &Tombstones::new());
            tracing::debug!("no remote tier; dropped deletion tombstones");
        }
    }

    fn load_users(&self) -> RegistryMap {
        self.local
            .get(Namespace::Registry, USERS_KEY)
            .unwrap_or_default()
    }

    fn load_tombstones(&self) -> Tombstones {
        self.local
            .get(Namespace::Registry, TOMBSTONES_KEY)
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, WriteState> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sorted(mut records: Vec<RegistryRecord>) -> Vec<RegistryRecord> {
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::sync::spawn_replicator;

    fn local_only() -> RegistryManager {
        RegistryManager::new(Arc::new(Persistence::in_memory()), ReplicatorHandle::disabled())
    }

    fn ids(records: &[RegistryRecord]) -> Vec<&str> {
        records.iter().map(|r| r.identity_id.as_str()).collect()
    }

    #[test]
    fn test_first_upsert_creates_unenrolled_record() {
        let registry = local_only();
        let record = registry
            .upsert(&RegistryPatch::new("u1").email(Some("u1@example.com".into())))
            .unwrap();
        assert!(!record.enrolled);
        assert_eq!(record.email.as_deref(), Some("u1@example.com"));
        assert_eq!(registry.get("u1"), Some(record));
    }

    #[test]
    fn test_implicit_stamps_strictly_increase() {
        let registry = local_only();
        let mut last = Timestamp::MIN;
        for i in 0..20 {
            let record = registry
                .upsert(&RegistryPatch::new("u1").display_name(Some(format!("name {i}"))))
                .unwrap();
            assert!(record.updated_at > last);
            last = record.updated_at;
        }
    }

    #[test]
    fn test_later_stamp_wins_regardless_of_arrival_order() {
        let registry = local_only();
        let newer = RegistryPatch::new("u1")
            .display_name(Some("newer".into()))
            .updated_at(200);
        let older = RegistryPatch::new("u1")
            .display_name(Some("older".into()))
            .email(Some("old@example.com".into()))
            .updated_at(100);

        registry.upsert(&newer);
        let visible = registry.upsert(&older).unwrap();

        assert_eq!(visible.display_name.as_deref(), Some("newer"));
        assert_eq!(visible.email, None);
        assert_eq!(visible.updated_at, 200);
        assert_eq!(registry.get("u1"), Some(visible));
    }

    #[tokio::test]
    async fn test_listing_order_newest_first_then_identity() {
        let registry = local_only();
        registry.upsert(&RegistryPatch::new("b").updated_at(100));
        registry.upsert(&RegistryPatch::new("c").updated_at(200));
        registry.upsert(&RegistryPatch::new("a").updated_at(100));

        let listed = registry.list_all().await;
        assert_eq!(ids(&listed), ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_remote_listing_replaces_local() {
        let remote = MemoryRemote::new();
        let registry = RegistryManager::new(
            Arc::new(Persistence::in_memory()),
            spawn_replicator(remote.clone()).unwrap(),
        );
        registry.upsert(&RegistryPatch::new("local").updated_at(500));
        remote.insert_record(RegistryRecord {
            display_name: Some("from remote".into()),
            ..RegistryRecord::new("remote-only", 10)
        });

        let listed = registry.list_all().await;
        assert_eq!(ids(&listed), ["local", "remote-only"]);
        assert_eq!(
            registry.get("remote-only").and_then(|r| r.display_name),
            Some("from remote".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreachable_remote_lists_local() {
        let remote = MemoryRemote::new();
        remote.set_unreachable(true);
        let registry = RegistryManager::new(
            Arc::new(Persistence::in_memory()),
            spawn_replicator(remote).unwrap(),
        );
        registry.upsert(&RegistryPatch::new("u1"));

        let listed = registry.list_all().await;
        assert_eq!(ids(&listed), ["u1"]);
    }

    fn with_remote(remote: &MemoryRemote) -> RegistryManager {
        RegistryManager::new(
            Arc::new(Persistence::in_memory()),
            spawn_replicator(remote.clone()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_tombstone_hides_stale_remote_record() {
        let remote = MemoryRemote::new();
        let registry = with_remote(&remote);
        registry.upsert(&RegistryPatch::new("gone"));
        registry.remove_local("gone");

        assert!(registry.list_all().await.is_empty());
        assert!(remote.record("gone").is_some());
        assert!(registry.tombstone("gone").is_some_and(|t| t.record));

        // A newer write elsewhere brings the identity back.
        let deleted_at = registry.tombstone("gone").unwrap().deleted_at;
        remote.insert_record(RegistryRecord::new("gone", deleted_at + 10));
        assert_eq!(ids(&registry.list_all().await), ["gone"]);
        assert!(registry.tombstone("gone").is_some_and(|t| !t.record));
    }

    #[tokio::test]
    async fn test_listing_settles_only_the_record_copy() {
        let remote = MemoryRemote::new();
        let registry = with_remote(&remote);
        registry.upsert(&RegistryPatch::new("u1"));
        let deleted_at = registry.remove_local("u1");
        registry.sync.flush().await;
        assert!(remote.record("u1").is_some());

        // The remote record is gone but nothing is known about the embedding.
        remote.remove_record("u1");
        assert!(registry.list_all().await.is_empty());
        assert_eq!(
            registry.tombstone("u1"),
            Some(Tombstone {
                deleted_at,
                record: false,
                embedding: true,
            })
        );
        assert_eq!(registry.embedding_deleted_at("u1"), Some(deleted_at));

        registry.settle_embedding("u1");
        assert_eq!(registry.tombstone("u1"), None);
        assert_eq!(registry.embedding_deleted_at("u1"), None);
    }

    #[tokio::test]
    async fn test_write_older_than_deletion_is_ignored() {
        let remote = MemoryRemote::new();
        let registry = with_remote(&remote);
        registry.upsert(&RegistryPatch::new("u1").updated_at(100));
        let deleted_at = registry.remove_local("u1");

        assert_eq!(registry.upsert(&RegistryPatch::new("u1").updated_at(deleted_at)), None);
        assert_eq!(registry.get("u1"), None);

        let revived = registry.upsert(&RegistryPatch::new("u1")).unwrap();
        assert!(revived.updated_at > deleted_at);
        // The record copy is superseded; the embedding copy is still unsettled.
        assert!(registry.tombstone("u1").is_some_and(|t| !t.record && t.embedding));
    }

    #[test]
    fn test_equal_explicit_stamp_still_increases() {
        let registry = local_only();
        registry.upsert(&RegistryPatch::new("u1").display_name(Some("first".into())).updated_at(100));
        let tied = registry
            .upsert(&RegistryPatch::new("u1").display_name(Some("second".into())).updated_at(100))
            .unwrap();

        assert_eq!(tied.display_name.as_deref(), Some("second"));
        assert_eq!(tied.updated_at, 101);
    }

    #[tokio::test]
    async fn test_no_tombstones_without_remote_tier() {
        let local = Arc::new(Persistence::in_memory());
        let registry = RegistryManager::new(Arc::clone(&local), ReplicatorHandle::disabled());
        registry.upsert(&RegistryPatch::new("u1"));
        registry.remove_local("u1");
        assert_eq!(registry.tombstone("u1"), None);

        // Left over from a run that had a remote tier configured.
        let mut leftover = Tombstones::new();
        leftover.insert(
            "old".to_string(),
            Tombstone {
                deleted_at: 1,
                record: true,
                embedding: true,
            },
        );
        local.set(Namespace::Registry, TOMBSTONES_KEY, &leftover);
        assert!(registry.tombstone("old").is_some());

        registry.list_all().await;
        assert_eq!(registry.tombstone("old"), None);
    }

    #[test]
    fn test_write_during_listing_survives_adoption() {
        let registry = local_only();
        registry.upsert(&RegistryPatch::new("early").updated_at(10));
        let since = registry.lock().generation;
        registry.upsert(&RegistryPatch::new("late").updated_at(20));

        let mut remote = HashMap::new();
        remote.insert("early".to_string(), RegistryRecord::new("early", 10));
        remote.insert("other".to_string(), RegistryRecord::new("other", 5));

        let listed = registry.adopt_remote(remote, since);
        assert_eq!(ids(&listed), ["late", "early", "other"]);
        assert!(registry.get("late").is_some());
    }

    #[test]
    fn test_newer_remote_copy_beats_write_during_listing() {
        let registry = local_only();
        let since = registry.lock().generation;
        registry.upsert(&RegistryPatch::new("u1").display_name(Some("local".into())).updated_at(20));

        let mut remote = HashMap::new();
        remote.insert(
            "u1".to_string(),
            RegistryRecord {
                display_name: Some("remote".into()),
                ..RegistryRecord::new("u1", 30)
            },
        );

        registry.adopt_remote(remote, since);
        assert_eq!(registry.get("u1").and_then(|r| r.display_name), Some("remote".to_string()));
    }
}
