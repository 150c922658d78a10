//! Session boundary: where the network layer gets the current identity and
//! access token from.
//!
//! The identity provider itself (login flow, credential storage) lives
//! outside this crate. It only has to implement [`SessionProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use mission_control_shared::{Session, StreamIdentity};
use parking_lot::RwLock;

/// Source of the signed-in user's session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current session, `None` when signed out.
    async fn session(&self) -> Option<Session>;
}

/// In-memory session holder for applications that manage sign-in themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    session: Arc<RwLock<Option<Session>>>,
}

impl StaticSession {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
        }
    }

    /// Sign in with an already issued token.
    pub fn login(&self, session: Session) {
        crate::log_info!("Session started for user {}", session.user_id);
        *self.session.write() = Some(session);
    }

    /// Sign out and forget the session.
    pub fn logout(&self) {
        if let Some(previous) = self.session.write().take() {
            crate::log_info!("Session ended for user {}", previous.user_id);
        }
    }

    /// Replace the access token after an out-of-band refresh.
    pub fn set_access_token(&self, token: impl Into<String>) {
        if let Some(session) = self.session.write().as_mut() {
            session.access_token = Some(token.into());
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.user_id.clone())
    }

    pub fn identity(&self) -> Option<StreamIdentity> {
        self.session.read().as_ref().map(Session::identity)
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }
}
