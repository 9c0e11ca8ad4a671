use facevault_core::{Descriptor, Embedding, OfflineSession, RegistryPatch, VerifiedAccount};
use facevault_store::BiometricStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.freedesktop.FaceVault1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceVault1";

/// D-Bus interface for the FaceVault identity store.
///
/// Structured values are exchanged as JSON strings; absent values are
/// returned as `"null"`.
pub struct FaceVaultService {
    store: BiometricStore,
}

impl FaceVaultService {
    pub fn new(store: BiometricStore) -> Self {
        Self { store }
    }
}

#[interface(name = "org.freedesktop.FaceVault1")]
impl FaceVaultService {
    /// Store an embedding (`{identityId, descriptor, updatedAt}`) and mark the identity enrolled.
    async fn save_embedding(&self, embedding_json: &str) -> fdo::Result<()> {
        let embedding: Embedding = parse(embedding_json, "embedding")?;
        tracing::info!(identity = %embedding.identity_id, "save_embedding requested");
        self.store.save_embedding(&embedding);
        Ok(())
    }

    async fn get_embedding(&self, identity_id: &str) -> fdo::Result<String> {
        to_json(&self.store.get_embedding(identity_id).await)
    }

    async fn delete_user_record(&self, identity_id: &str) -> fdo::Result<()> {
        tracing::info!(identity = identity_id, "delete_user_record requested");
        self.store.delete_user_record(identity_id);
        Ok(())
    }

    /// Merge a partial record; returns the record visible afterwards.
    async fn update_registry(&self, patch_json: &str) -> fdo::Result<String> {
        let patch: RegistryPatch = parse(patch_json, "registry patch")?;
        to_json(&self.store.update_registry(&patch))
    }

    async fn list_registered_users(&self) -> fdo::Result<String> {
        to_json(&self.store.list_registered_users().await)
    }

    async fn set_offline_session(&self, session_json: &str) -> fdo::Result<()> {
        let session: OfflineSession = parse(session_json, "offline session")?;
        self.store.set_offline_session(&session);
        Ok(())
    }

    async fn get_offline_session(&self) -> fdo::Result<String> {
        to_json(&self.store.get_offline_session())
    }

    async fn clear_offline_session(&self) -> fdo::Result<()> {
        self.store.clear_offline_session();
        Ok(())
    }

    /// Returns `(is_match, distance)`. A negative threshold selects the configured one.
    async fn compare_descriptors(
        &self,
        stored: Vec<f64>,
        live: Vec<f64>,
        threshold: f64,
    ) -> fdo::Result<(bool, f64)> {
        let stored = descriptor(&stored)?;
        let live = descriptor(&live)?;
        let threshold = (threshold >= 0.0).then_some(threshold as f32);
        let result = self.store.compare_descriptors(&stored, &live, threshold);
        Ok((result.is_match, f64::from(result.distance)))
    }

    /// Biometric login. An empty `live` array means no face was detected.
    async fn authenticate(&self, identity_id: &str, live: Vec<f64>) -> fdo::Result<String> {
        tracing::info!(identity = identity_id, "authenticate requested");
        let live = if live.is_empty() {
            None
        } else {
            Some(descriptor(&live)?)
        };
        to_json(&self.store.authenticate(identity_id, live.as_ref()).await)
    }

    async fn confirm_sign_in(&self, account_json: &str) -> fdo::Result<String> {
        let account: VerifiedAccount = parse(account_json, "account")?;
        to_json(&self.store.confirm_sign_in(&account).await)
    }

    async fn resume_offline_session(&self) -> fdo::Result<String> {
        to_json(&self.store.resume_offline().await)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store": self.store.status(),
        })
        .to_string())
    }
}

fn parse<T: DeserializeOwned>(json: &str, what: &str) -> fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| fdo::Error::InvalidArgs(format!("invalid {what}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn descriptor(values: &[f64]) -> fdo::Result<Descriptor> {
    Descriptor::from_f64(values).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}
