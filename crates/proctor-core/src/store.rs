//! Storage abstraction for signatures, registered keys, and event history.
//!
//! This module defines the collaborator traits consumed by the core and
//! provides in-memory implementations for testing and single-process use.
//! Persistence itself (relational or otherwise) is an external concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::event::{ClientEvent, EventType};
use crate::types::{ExamId, InstitutionId, KeyId};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("field validation failed: {0}")]
    Validation(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Data Models
// ============================================================================

/// Scope of a registered trusted signature.
///
/// Global records apply to every exam of the institution; exam records
/// carry the exam they were granted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    Global,
    Exam(ExamId),
}

impl KeyScope {
    pub fn exam_id(&self) -> Option<ExamId> {
        match self {
            KeyScope::Global => None,
            KeyScope::Exam(id) => Some(*id),
        }
    }
}

/// How a registered key's value is encrypted.
///
/// Certificate-based encryption is an extension point: such records are
/// carried by the registry but never matched by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    InternalPassword,
    Certificate,
}

/// A registered trusted signature. Created by explicit registration,
/// never mutated, deleted by administrative action only.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityKeyRecord {
    pub id: KeyId,
    pub institution_id: InstitutionId,
    pub scope: KeyScope,
    /// Ciphertext, encrypted per `encryption_type`.
    pub encrypted_value: String,
    pub encryption_type: EncryptionType,
    /// Human label.
    pub tag: String,
}

/// A key registration request, before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewSecurityKey {
    pub institution_id: InstitutionId,
    pub scope: KeyScope,
    pub encrypted_value: String,
    pub encryption_type: EncryptionType,
    pub tag: String,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Durable per-connection signature attribute. First write wins.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    async fn get(&self, connection_token: &str) -> Result<Option<String>, StoreError>;

    /// Store the signature unless one is already present for the
    /// connection.
    async fn put_if_absent(
        &self,
        connection_token: &str,
        ciphertext: &str,
    ) -> Result<(), StoreError>;
}

/// Registry of explicitly registered trusted signatures.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// All records visible to the given institution and exam: global
    /// records plus records scoped to that exam.
    async fn all_for(
        &self,
        institution_id: InstitutionId,
        exam_id: Option<ExamId>,
    ) -> Result<Vec<SecurityKeyRecord>, StoreError>;

    async fn register(&self, key: NewSecurityKey) -> Result<SecurityKeyRecord, StoreError>;

    /// Delete by id, returning the deleted record.
    async fn delete(&self, key_id: KeyId) -> Result<SecurityKeyRecord, StoreError>;
}

/// Append-only store of client events, the canonical source for indicator
/// recovery.
#[async_trait]
pub trait EventHistoryStore: Send + Sync {
    async fn append(&self, connection_token: &str, event: ClientEvent) -> Result<(), StoreError>;

    /// All stored events for the connection matching one of the given
    /// types, in submission order.
    async fn all_for(
        &self,
        connection_token: &str,
        event_types: &[EventType],
    ) -> Result<Vec<ClientEvent>, StoreError>;
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

/// In-memory signature store.
#[derive(Default)]
pub struct InMemorySignatureStore {
    signatures: RwLock<HashMap<String, String>>,
}

impl InMemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignatureStore for InMemorySignatureStore {
    async fn get(&self, connection_token: &str) -> Result<Option<String>, StoreError> {
        Ok(self.signatures.read().await.get(connection_token).cloned())
    }

    async fn put_if_absent(
        &self,
        connection_token: &str,
        ciphertext: &str,
    ) -> Result<(), StoreError> {
        self.signatures
            .write()
            .await
            .entry(connection_token.to_string())
            .or_insert_with(|| ciphertext.to_string());
        Ok(())
    }
}

/// In-memory key registry.
pub struct InMemoryKeyRegistry {
    keys: RwLock<Vec<SecurityKeyRecord>>,
    next_id: AtomicI64,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(Vec::new()),
            // Ids are positive; 0 is never handed out.
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn all_for(
        &self,
        institution_id: InstitutionId,
        exam_id: Option<ExamId>,
    ) -> Result<Vec<SecurityKeyRecord>, StoreError> {
        let keys = self.keys.read().await;
        Ok(keys
            .iter()
            .filter(|k| k.institution_id == institution_id)
            .filter(|k| match k.scope {
                KeyScope::Global => true,
                KeyScope::Exam(id) => exam_id == Some(id),
            })
            .cloned()
            .collect())
    }

    async fn register(&self, key: NewSecurityKey) -> Result<SecurityKeyRecord, StoreError> {
        if key.tag.trim().is_empty() {
            return Err(StoreError::Validation("securityKey:tag:mandatory".into()));
        }
        let record = SecurityKeyRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            institution_id: key.institution_id,
            scope: key.scope,
            encrypted_value: key.encrypted_value,
            encryption_type: key.encryption_type,
            tag: key.tag,
        };
        self.keys.write().await.push(record.clone());
        Ok(record)
    }

    async fn delete(&self, key_id: KeyId) -> Result<SecurityKeyRecord, StoreError> {
        let mut keys = self.keys.write().await;
        let pos = keys
            .iter()
            .position(|k| k.id == key_id)
            .ok_or_else(|| StoreError::NotFound(format!("security key {}", key_id)))?;
        Ok(keys.remove(pos))
    }
}

/// In-memory event history.
#[derive(Default)]
pub struct InMemoryEventHistory {
    events: RwLock<HashMap<String, Vec<ClientEvent>>>,
}

impl InMemoryEventHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventHistoryStore for InMemoryEventHistory {
    async fn append(&self, connection_token: &str, event: ClientEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .await
            .entry(connection_token.to_string())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn all_for(
        &self,
        connection_token: &str,
        event_types: &[EventType],
    ) -> Result<Vec<ClientEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .get(connection_token)
            .map(|all| {
                all.iter()
                    .filter(|e| event_types.contains(&e.event_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
