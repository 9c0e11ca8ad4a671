//! Login and sign-in glue on top of the store.
//!
//! Biometric login writes the offline session; a later identity-provider
//! sign-in refreshes the registry and clears it.

use crate::store::BiometricStore;
use facevault_core::{
    Descriptor, EuclideanMatcher, Matcher, OfflineSession, RegistryPatch, RegistryRecord,
    VerifiedAccount,
};
use serde::Serialize;

/// Result of a biometric login attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum AuthOutcome {
    /// No stored embedding for the identity.
    NotEnrolled,
    /// The extractor found no face; ask the user to retry.
    NoFaceDetected,
    NoMatch { distance: f32 },
    Matched {
        distance: f32,
        session: OfflineSession,
    },
}

/// Offline session restored at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumedSession {
    pub session: OfflineSession,
    /// Whether the identity still has a stored embedding.
    pub enrolled: bool,
}

impl BiometricStore {
    /// Match `live` against the stored embedding for `identity_id`.
    ///
    /// `live` is `None` when the extractor found no face in the frame. On a
    /// match the offline session is written for the identity.
    pub async fn authenticate(&self, identity_id: &str, live: Option<&Descriptor>) -> AuthOutcome {
        let Some(stored) = self.get_embedding(identity_id).await else {
            tracing::info!(identity = identity_id, "no stored embedding");
            return AuthOutcome::NotEnrolled;
        };
        let Some(live) = live else {
            return AuthOutcome::NoFaceDetected;
        };

        let matcher = EuclideanMatcher {
            threshold: self.match_threshold(),
        };
        let result = matcher.compare(&stored.descriptor, live);
        if !result.is_match {
            tracing::info!(identity = identity_id, distance = result.distance, "face mismatch");
            return AuthOutcome::NoMatch {
                distance: result.distance,
            };
        }

        let record = self.registry().get(identity_id);
        let session = OfflineSession::new(
            identity_id,
            record.as_ref().and_then(|r| r.email.clone()),
            record.and_then(|r| r.display_name),
        );
        self.set_offline_session(&session);
        tracing::info!(identity = identity_id, distance = result.distance, "face matched");

        AuthOutcome::Matched {
            distance: result.distance,
            session,
        }
    }

    /// Record a verified identity-provider sign-in.
    ///
    /// Refreshes the registry from the account handle, derives the
    /// enrollment flag from the stored embedding, and clears any offline
    /// session.
    pub async fn confirm_sign_in(&self, account: &VerifiedAccount) -> Option<RegistryRecord> {
        let enrolled = self.get_embedding(&account.identity_id).await.is_some();
        let record = self.update_registry(
            &RegistryPatch::new(&account.identity_id)
                .email(account.email.clone())
                .display_name(account.display_name.clone())
                .photo_url(account.photo_url.clone())
                .enrolled(enrolled),
        );
        self.clear_offline_session();
        tracing::info!(identity = %account.identity_id, enrolled, "identity provider sign-in confirmed");
        record
    }

    /// The pending offline session, if any, with its enrollment state.
    pub async fn resume_offline(&self) -> Option<ResumedSession> {
        let session = self.get_offline_session()?;
        let enrolled = self.get_embedding(&session.identity_id).await.is_some();
        Some(ResumedSession { session, enrolled })
    }
}
