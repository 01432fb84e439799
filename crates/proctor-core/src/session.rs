//! Connection registry and per-connection session state.
//!
//! One mutable session record per active exam-client connection, keyed by
//! an opaque connection token assigned at handshake time. All mutation is
//! scoped per connection: each record lives behind its own lock so a
//! client's event submissions can interleave with administrator calls for
//! the same connection without global serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{ExamId, InstitutionId};

/// Status of an exam-client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Closed,
}

/// One session record per active exam client.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    /// Opaque, unique, assigned at connect time. Immutable.
    pub connection_token: String,
    pub institution_id: InstitutionId,
    /// Unknown until the client's handshake completes.
    pub exam_id: Option<ExamId>,
    pub status: ConnectionStatus,
    /// Sticky once true; never reverts to false.
    pub security_check_granted: bool,
    /// At most one per connection, set on first successful signature
    /// submission. The value is the client's self-encrypted ciphertext.
    pub stored_signature: Option<String>,
}

impl ConnectionSession {
    fn new(connection_token: &str, institution_id: InstitutionId) -> Self {
        Self {
            connection_token: connection_token.to_string(),
            institution_id,
            exam_id: None,
            status: ConnectionStatus::Active,
            security_check_granted: false,
            stored_signature: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

/// Shared handle to a session record.
pub type SessionHandle = Arc<RwLock<ConnectionSession>>;

/// Registry of active exam-client connections.
///
/// Closed sessions stay in the registry as archived records so late calls
/// against them resolve to the "unknown connection" case rather than a
/// fresh session.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a connecting client.
    ///
    /// Duplicate handshake retries for the same token return the existing
    /// session.
    pub async fn connect(&self, token: &str, institution_id: InstitutionId) -> SessionHandle {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(token) {
            debug!("duplicate handshake for connection: {}", token);
            return Arc::clone(existing);
        }
        let session = Arc::new(RwLock::new(ConnectionSession::new(token, institution_id)));
        sessions.insert(token.to_string(), Arc::clone(&session));
        debug!("registered connection: {}", token);
        session
    }

    /// Look up a session by token, whether active or closed.
    pub async fn session_for(&self, token: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Look up a session by token; `None` for unknown or closed connections.
    pub async fn active_session_for(&self, token: &str) -> Option<SessionHandle> {
        let session = self.session_for(token).await?;
        if session.read().await.is_active() {
            Some(session)
        } else {
            None
        }
    }

    /// Whether the connection is known and active.
    pub async fn is_active(&self, token: &str) -> bool {
        self.active_session_for(token).await.is_some()
    }

    /// Record the exam a connection belongs to, once the handshake
    /// completes. Returns false for unknown connections.
    pub async fn update_exam(&self, token: &str, exam_id: ExamId) -> bool {
        match self.session_for(token).await {
            Some(session) => {
                session.write().await.exam_id = Some(exam_id);
                true
            }
            None => false,
        }
    }

    /// Tokens of all active connections in the given exam.
    pub async fn tokens_for(&self, exam_id: ExamId) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut tokens = Vec::new();
        for (token, session) in sessions.iter() {
            let session = session.read().await;
            if session.is_active() && session.exam_id == Some(exam_id) {
                tokens.push(token.clone());
            }
        }
        tokens
    }

    /// Tokens of all active connections, across exams.
    pub async fn active_tokens(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut tokens = Vec::new();
        for (token, session) in sessions.iter() {
            if session.read().await.is_active() {
                tokens.push(token.clone());
            }
        }
        tokens
    }

    /// Close a connection, archiving its session record. Returns false for
    /// unknown connections; closing twice is a no-op.
    pub async fn close(&self, token: &str) -> bool {
        match self.session_for(token).await {
            Some(session) => {
                session.write().await.status = ConnectionStatus::Closed;
                debug!("closed connection: {}", token);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let first = registry.connect("token-1", 1).await;
        first.write().await.security_check_granted = true;

        let second = registry.connect("token-1", 1).await;
        assert!(second.read().await.security_check_granted);
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.session_for("missing").await.is_none());
        assert!(!registry.is_active("missing").await);
        assert!(!registry.close("missing").await);
    }

    #[tokio::test]
    async fn tokens_for_filters_exam_and_status() {
        let registry = ConnectionRegistry::new();
        registry.connect("a", 1).await;
        registry.connect("b", 1).await;
        registry.connect("c", 1).await;
        registry.update_exam("a", 7).await;
        registry.update_exam("b", 7).await;
        registry.update_exam("c", 8).await;
        registry.close("b").await;

        let tokens = registry.tokens_for(7).await;
        assert_eq!(tokens, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn closed_session_is_archived_not_recreated() {
        let registry = ConnectionRegistry::new();
        registry.connect("a", 1).await;
        registry.close("a").await;

        assert!(registry.session_for("a").await.is_some());
        assert!(registry.active_session_for("a").await.is_none());
    }
}
