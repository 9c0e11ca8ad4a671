//! Session Manager: one offline session slot, local tier only.

use crate::persistence::{Namespace, Persistence};
use facevault_core::OfflineSession;
use std::sync::Arc;

/// The only key in the session namespace.
pub const SESSION_KEY: &str = "offline-session";

#[derive(Clone)]
pub struct SessionManager {
    local: Arc<Persistence>,
}

impl SessionManager {
    pub fn new(local: Arc<Persistence>) -> Self {
        Self { local }
    }

    /// Overwrite the slot.
    pub fn set(&self, session: &OfflineSession) {
        let durable = self.local.set(Namespace::Session, SESSION_KEY, session);
        tracing::info!(identity = %session.identity_id, durable, "offline session stored");
    }

    pub fn get(&self) -> Option<OfflineSession> {
        self.local.get(Namespace::Session, SESSION_KEY)
    }

    pub fn clear(&self) {
        self.local.remove(Namespace::Session, SESSION_KEY);
        tracing::debug!("offline session cleared");
    }
}
