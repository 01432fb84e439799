//! One-shot instruction delivery to exam clients.
//!
//! Administrators issue commands (quit, reconfigure, ...) that the server
//! can only deliver over the client's own polling channel. Each connection
//! has at most one active pending instruction; confirmable instructions are
//! re-delivered byte-identical on every poll until acknowledged by their
//! confirm number, non-confirmable ones are delivered exactly once.
//! Instructions registered while one is outstanding queue behind it in a
//! bounded FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::session::ConnectionRegistry;
use crate::types::millis_now;

/// Maximum instructions queued behind the active slot per connection.
/// Registrations beyond this drop the oldest queued entry.
const INSTRUCTION_QUEUE_MAX_SIZE: usize = 10;

/// JSON key of the instruction type.
const JSON_INST: &str = "instruction";
/// JSON key of the attribute object.
const JSON_ATTR: &str = "attributes";
/// Attribute key carrying the confirm number of confirmable instructions.
const JSON_CONFIRM: &str = "instruction-confirm";

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by instruction registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    /// The target connection is unknown or not in an active state.
    #[error("connection not ready for instructions: {0}")]
    InactiveConnection(String),
}

// ============================================================================
// Instruction Types
// ============================================================================

/// Server-issued one-shot command types, with their exact wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionType {
    SebQuit,
    SebReconfigureSettings,
    SebProctoring,
    SebForceLockScreen,
    NotificationConfirm,
}

impl InstructionType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            InstructionType::SebQuit => "SEB_QUIT",
            InstructionType::SebReconfigureSettings => "SEB_RECONFIGURE_SETTINGS",
            InstructionType::SebProctoring => "SEB_PROCTORING",
            InstructionType::SebForceLockScreen => "SEB_FORCE_LOCK_SCREEN",
            InstructionType::NotificationConfirm => "NOTIFICATION_CONFIRM",
        }
    }
}

/// A registered instruction waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInstruction {
    pub instruction_type: InstructionType,
    /// Caller-supplied attributes, delivered in insertion order.
    pub attributes: Vec<(String, String)>,
    pub needs_confirm: bool,
    /// Assigned when `needs_confirm` is true; monotonically increasing per
    /// service so a stale confirm can never hit a newer instruction.
    pub confirm_number: Option<u64>,
    /// Registration timestamp in milliseconds.
    pub registered_at: i64,
}

impl PendingInstruction {
    /// Serialize to the client payload.
    ///
    /// `{"instruction": <type>}`; attributes merge in under `"attributes"`
    /// with caller-supplied keys first and the confirm number injected last
    /// as a decimal string.
    fn to_json(&self) -> String {
        let mut attributes = Map::new();
        for (key, value) in &self.attributes {
            attributes.insert(key.clone(), Value::String(value.clone()));
        }
        if let Some(number) = self.confirm_number {
            attributes.insert(JSON_CONFIRM.to_string(), Value::String(number.to_string()));
        }

        let mut payload = Map::new();
        payload.insert(
            JSON_INST.to_string(),
            Value::String(self.instruction_type.wire_name().to_string()),
        );
        if !attributes.is_empty() {
            payload.insert(JSON_ATTR.to_string(), Value::Object(attributes));
        }
        Value::Object(payload).to_string()
    }
}

/// Per-connection instruction slot: one active instruction plus a bounded
/// backlog behind it.
#[derive(Debug, Default)]
struct InstructionSlot {
    active: Option<PendingInstruction>,
    backlog: VecDeque<PendingInstruction>,
}

impl InstructionSlot {
    fn push(&mut self, instruction: PendingInstruction, token: &str) {
        if self.active.is_none() {
            self.active = Some(instruction);
            return;
        }
        if self.backlog.len() >= INSTRUCTION_QUEUE_MAX_SIZE {
            warn!(
                "instruction backlog full for connection {}, dropping oldest entry",
                token
            );
            self.backlog.pop_front();
        }
        self.backlog.push_back(instruction);
    }

    fn promote(&mut self) {
        self.active = self.backlog.pop_front();
    }

    fn is_empty(&self) -> bool {
        self.active.is_none() && self.backlog.is_empty()
    }
}

// ============================================================================
// Instruction Service
// ============================================================================

/// Delivery service for administrator-issued instructions.
pub struct InstructionService {
    connections: Arc<ConnectionRegistry>,
    slots: RwLock<HashMap<String, Arc<Mutex<InstructionSlot>>>>,
    confirm_counter: AtomicU64,
}

impl InstructionService {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            slots: RwLock::new(HashMap::new()),
            confirm_counter: AtomicU64::new(1),
        }
    }

    /// Register an instruction for a single connection.
    ///
    /// Targeting an unknown or closed connection is reported as an error
    /// and has no state effect. The activity check is not atomic against a
    /// concurrent close; a registration that slips past one leaves a slot
    /// that [`cleanup`](Self::cleanup) drops.
    pub async fn register_instruction(
        &self,
        connection_token: &str,
        instruction_type: InstructionType,
        attributes: Vec<(String, String)>,
        needs_confirm: bool,
    ) -> Result<(), InstructionError> {
        if !self.connections.is_active(connection_token).await {
            return Err(InstructionError::InactiveConnection(
                connection_token.to_string(),
            ));
        }
        self.enqueue(connection_token, instruction_type, attributes, needs_confirm)
            .await;
        Ok(())
    }

    /// Register the same instruction for a set of connections.
    ///
    /// Each target receives an independent slot entry with an independently
    /// assigned confirm number. Inactive targets are skipped with a
    /// warning rather than failing the broadcast.
    pub async fn register_instruction_all(
        &self,
        connection_tokens: &[String],
        instruction_type: InstructionType,
        attributes: Vec<(String, String)>,
        needs_confirm: bool,
    ) {
        for token in connection_tokens {
            if !self.connections.is_active(token).await {
                warn!(
                    "connection {} is not in a ready state to process instructions, skipped",
                    token
                );
                continue;
            }
            self.enqueue(token, instruction_type, attributes.clone(), needs_confirm)
                .await;
        }
    }

    async fn enqueue(
        &self,
        token: &str,
        instruction_type: InstructionType,
        attributes: Vec<(String, String)>,
        needs_confirm: bool,
    ) {
        let confirm_number =
            needs_confirm.then(|| self.confirm_counter.fetch_add(1, Ordering::SeqCst));
        let instruction = PendingInstruction {
            instruction_type,
            attributes,
            needs_confirm,
            confirm_number,
            registered_at: millis_now(),
        };
        let slot = self.slot_for(token).await;
        let mut slot = slot.lock().await;
        debug!(
            "register instruction {:?} for connection {} (confirm: {:?})",
            instruction_type, token, confirm_number
        );
        slot.push(instruction, token);
    }

    /// Deliver the pending instruction for the connection's next poll.
    ///
    /// Non-confirmable instructions are forgotten on delivery; confirmable
    /// ones are re-delivered byte-identical, including their confirm
    /// number, until acknowledged. Unknown connections and empty slots
    /// yield `None` (no body, not an error).
    pub async fn get_instruction_json(&self, connection_token: &str) -> Option<String> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(connection_token).cloned()
        }?;
        let mut slot = slot.lock().await;
        let instruction = slot.active.as_ref()?;
        let json = instruction.to_json();
        if !instruction.needs_confirm {
            slot.promote();
        }
        debug!(
            "send instruction {} to connection {}",
            json, connection_token
        );
        Some(json)
    }

    /// Acknowledge a confirmable instruction by its confirm number.
    ///
    /// Only the exact number of the currently pending instruction removes
    /// it; a stale or mismatched number is a no-op.
    pub async fn confirm_instruction_done(&self, connection_token: &str, confirm_number: u64) {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(connection_token).cloned()
        };
        let Some(slot) = slot else {
            debug!(
                "instruction confirmation for unknown connection: {}",
                connection_token
            );
            return;
        };
        let mut slot = slot.lock().await;
        match &slot.active {
            Some(active) if active.confirm_number == Some(confirm_number) => {
                debug!(
                    "instruction {} confirmed by connection {}",
                    confirm_number, connection_token
                );
                slot.promote();
            }
            _ => {
                debug!(
                    "stale instruction confirmation {} from connection {}, ignored",
                    confirm_number, connection_token
                );
            }
        }
    }

    /// Discard all pending instructions of a closing connection.
    pub async fn discard(&self, connection_token: &str) {
        self.slots.write().await.remove(connection_token);
    }

    /// Drop slots of connections that are no longer active, whether their
    /// queues are empty or not. Also the backstop for registrations that
    /// raced a concurrent close.
    pub async fn cleanup(&self) {
        let tokens: Vec<String> = {
            let slots = self.slots.read().await;
            slots.keys().cloned().collect()
        };
        let mut stale = Vec::new();
        for token in tokens {
            if !self.connections.is_active(&token).await {
                stale.push(token);
            }
        }
        if stale.is_empty() {
            return;
        }
        let mut slots = self.slots.write().await;
        for token in stale {
            if slots.remove(&token).is_some() {
                debug!("dropped instruction slot for inactive connection: {}", token);
            }
        }
    }

    /// Whether the connection has anything pending.
    pub async fn has_pending(&self, connection_token: &str) -> bool {
        let slots = self.slots.read().await;
        match slots.get(connection_token) {
            Some(slot) => !slot.lock().await.is_empty(),
            None => false,
        }
    }

    async fn slot_for(&self, token: &str) -> Arc<Mutex<InstructionSlot>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(token) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(token.to_string()).or_default())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
