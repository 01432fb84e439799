//! Session-facing service composing the core collaborators.
//!
//! `ClientSessionService` owns the wiring between the connection
//! registry, the signature verifier, the instruction service, and the
//! indicator engine, and drives the lifecycle transitions that touch
//! more than one of them. Callers that only need one collaborator reach
//! it through the accessors.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::event::ClientEvent;
use crate::indicator::{IndicatorDef, IndicatorEngine};
use crate::instruction::InstructionService;
use crate::security_key::{SecurityKeyError, SignatureVerifier};
use crate::session::{ConnectionRegistry, SessionHandle};
use crate::store::{EventHistoryStore, KeyRegistry, SignatureStore, StoreError};
use crate::types::{ExamId, InstitutionId};

/// Façade over the per-connection services.
pub struct ClientSessionService<K: KeyRegistry, S: SignatureStore, H: EventHistoryStore> {
    connections: Arc<ConnectionRegistry>,
    verifier: Arc<SignatureVerifier<K, S>>,
    instructions: Arc<InstructionService>,
    indicators: Arc<IndicatorEngine<H>>,
    history: Arc<H>,
}

impl<K: KeyRegistry, S: SignatureStore, H: EventHistoryStore> ClientSessionService<K, S, H> {
    pub fn new(
        keys: Arc<K>,
        signatures: Arc<S>,
        history: Arc<H>,
        internal_secret: impl Into<String>,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let verifier = Arc::new(SignatureVerifier::new(
            Arc::clone(&connections),
            keys,
            signatures,
            internal_secret,
        ));
        let instructions = Arc::new(InstructionService::new(Arc::clone(&connections)));
        let indicators = Arc::new(IndicatorEngine::new(Arc::clone(&history)));
        Self {
            connections,
            verifier,
            instructions,
            indicators,
            history,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn verifier(&self) -> &Arc<SignatureVerifier<K, S>> {
        &self.verifier
    }

    pub fn instructions(&self) -> &Arc<InstructionService> {
        &self.instructions
    }

    pub fn indicators(&self) -> &Arc<IndicatorEngine<H>> {
        &self.indicators
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    /// Register a connecting client and set up its indicator state.
    ///
    /// Until the exam is known the connection carries the default
    /// indicator set.
    pub async fn establish_connection(
        &self,
        connection_token: &str,
        institution_id: InstitutionId,
    ) -> SessionHandle {
        let session = self.connections.connect(connection_token, institution_id).await;
        self.indicators.init_connection(connection_token, None).await;
        session
    }

    /// Bind a connection to its exam once the handshake completes and
    /// rebuild its indicator set from the exam's definitions.
    pub async fn assign_exam(&self, connection_token: &str, exam_id: ExamId) -> bool {
        if !self.connections.update_exam(connection_token, exam_id).await {
            debug!("exam assignment for unknown connection: {}", connection_token);
            return false;
        }
        self.indicators
            .init_connection(connection_token, Some(exam_id))
            .await;
        true
    }

    /// Close a connection and release its delivery and indicator state.
    /// The session record stays archived in the registry.
    pub async fn close_connection(&self, connection_token: &str) -> bool {
        if !self.connections.close(connection_token).await {
            return false;
        }
        self.instructions.discard(connection_token).await;
        self.indicators.discard(connection_token).await;
        true
    }

    // ========================================================================
    // Event Intake
    // ========================================================================

    /// Accept one client-submitted event: persist it, then feed the
    /// indicator engine. Events from unknown or closed connections are
    /// dropped.
    pub async fn notify_client_event(&self, connection_token: &str, event: ClientEvent) {
        if !self.connections.is_active(connection_token).await {
            debug!("dropping event from inactive connection: {}", connection_token);
            return;
        }
        if let Err(error) = self.history.append(connection_token, event.clone()).await {
            warn!(
                "failed to persist event for connection {}: {}",
                connection_token, error
            );
        }
        self.indicators.notify_event(connection_token, &event).await;
    }

    /// Reload a connection's indicator values from the persisted history.
    pub async fn reset_indicators(&self, connection_token: &str) -> Result<(), StoreError> {
        self.indicators.reset(connection_token).await
    }

    // ========================================================================
    // Trust
    // ========================================================================

    /// Check and update a connection's signature grant.
    pub async fn check_signature(
        &self,
        connection_token: &str,
        submitted_signature: Option<&str>,
    ) -> Result<bool, SecurityKeyError> {
        self.verifier
            .check_signature(connection_token, submitted_signature)
            .await
    }

    // ========================================================================
    // Instruction Channel
    // ========================================================================

    /// Poll step of the client's update cycle: the pending instruction
    /// payload, if any.
    pub async fn poll_instruction(&self, connection_token: &str) -> Option<String> {
        self.instructions.get_instruction_json(connection_token).await
    }

    /// Client acknowledgement of a confirmable instruction.
    pub async fn confirm_instruction(&self, connection_token: &str, confirm_number: u64) {
        self.instructions
            .confirm_instruction_done(connection_token, confirm_number)
            .await;
    }

    // ========================================================================
    // Exam Configuration
    // ========================================================================

    /// Register an exam's indicator definitions. Applies to connections
    /// assigned to the exam afterwards.
    pub async fn define_exam_indicators(&self, exam_id: ExamId, defs: Vec<IndicatorDef>) {
        self.indicators.define_exam_indicators(exam_id, defs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::indicator::IndicatorType;
    use crate::instruction::InstructionType;
    use crate::store::{InMemoryEventHistory, InMemoryKeyRegistry, InMemorySignatureStore};

    fn service() -> ClientSessionService<InMemoryKeyRegistry, InMemorySignatureStore, InMemoryEventHistory>
    {
        ClientSessionService::new(
            Arc::new(InMemoryKeyRegistry::new()),
            Arc::new(InMemorySignatureStore::new()),
            Arc::new(InMemoryEventHistory::new()),
            "internal-secret",
        )
    }

    fn error_event(text: &str) -> ClientEvent {
        ClientEvent::new(EventType::ErrorLog, 0, 0, None, text)
    }

    #[tokio::test]
    async fn event_intake_updates_indicators_and_history() {
        let service = service();
        service
            .define_exam_indicators(
                7,
                vec![IndicatorDef::new("errors", IndicatorType::ErrorCount)],
            )
            .await;
        service.establish_connection("t", 1).await;
        service.assign_exam("t", 7).await;

        service.notify_client_event("t", error_event("e1")).await;
        service.notify_client_event("t", error_event("e2")).await;

        let errors = service
            .indicators()
            .indicator_values("t")
            .await
            .into_iter()
            .find(|v| v.indicator_type == IndicatorType::ErrorCount)
            .unwrap();
        assert_eq!(errors.value, 2.0);

        // Recovery path sees the same events.
        service.assign_exam("t", 7).await;
        service.reset_indicators("t").await.unwrap();
        let errors = service
            .indicators()
            .indicator_values("t")
            .await
            .into_iter()
            .find(|v| v.indicator_type == IndicatorType::ErrorCount)
            .unwrap();
        assert_eq!(errors.value, 2.0);
    }

    #[tokio::test]
    async fn events_from_closed_connections_are_dropped() {
        let service = service();
        service.establish_connection("t", 1).await;
        service.close_connection("t").await;

        service.notify_client_event("t", error_event("late")).await;

        let stored = service
            .history
            .all_for("t", &[EventType::ErrorLog])
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn instruction_poll_and_confirm_round_trip() {
        let service = service();
        service.establish_connection("t", 1).await;

        service
            .instructions()
            .register_instruction("t", InstructionType::SebForceLockScreen, Vec::new(), true)
            .await
            .unwrap();

        let payload = service.poll_instruction("t").await.unwrap();
        assert!(payload.contains("SEB_FORCE_LOCK_SCREEN"));
        assert!(payload.contains("instruction-confirm"));

        // Unconfirmed instructions are redelivered.
        assert!(service.poll_instruction("t").await.is_some());

        service.confirm_instruction("t", 1).await;
        assert_eq!(service.poll_instruction("t").await, None);
    }

    #[tokio::test]
    async fn close_releases_delivery_state() {
        let service = service();
        service.establish_connection("t", 1).await;
        service
            .instructions()
            .register_instruction("t", InstructionType::SebQuit, Vec::new(), false)
            .await
            .unwrap();

        assert!(service.close_connection("t").await);
        assert_eq!(service.poll_instruction("t").await, None);
        assert!(!service.close_connection("missing").await);
    }

    #[tokio::test]
    async fn signature_check_flows_through_the_facade() {
        let service = service();
        service.establish_connection("a", 1).await;
        service.assign_exam("a", 7).await;
        assert!(!service.check_signature("a", None).await.unwrap());
        assert!(!service.check_signature("ghost", None).await.unwrap());
    }
}
