//! App-signature trust verification.
//!
//! Decides, for a given connection, whether its claimed app-integrity
//! signature is trustworthy enough to grant a security pass. A submitted
//! signature is self-encrypted by the client with its connection token,
//! proving possession of that token. Trusted signatures are registered in
//! the key registry, each encrypted with one shared internal secret; when
//! no registered record matches, a statistical fallback compares against
//! the stored signatures of peer connections in the same exam.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use proctor_crypto::{decrypt, encrypt, hashes_equal, signature_hash, CryptoError};

use crate::session::ConnectionRegistry;
use crate::store::{
    EncryptionType, KeyRegistry, KeyScope, NewSecurityKey, SecurityKeyRecord, SignatureStore,
    StoreError,
};
use crate::types::{ExamId, InstitutionId, KeyId};

/// Default per-exam statistical trust threshold: a signature is trusted
/// when strictly more than this many peers share it.
const DEFAULT_STATISTICAL_THRESHOLD: u64 = 1;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by administrator-facing verifier operations.
#[derive(Debug, Error)]
pub enum SecurityKeyError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("no signature stored for connection: {0}")]
    NoSignature(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("signature decryption failed: {0}")]
    Crypto(#[from] CryptoError),
}

// ============================================================================
// Check Result
// ============================================================================

/// Outcome classification of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityCheckResult {
    /// Matched a registered record scoped to the connection's exam.
    pub exam_grant: bool,
    /// Matched a globally scoped registered record.
    pub global_grant: bool,
    /// Granted by peer comparison in the same exam.
    pub statistical_grant: bool,
}

impl SecurityCheckResult {
    pub const NO_GRANT: Self = Self {
        exam_grant: false,
        global_grant: false,
        statistical_grant: false,
    };

    pub fn has_any_grant(&self) -> bool {
        self.exam_grant || self.global_grant || self.statistical_grant
    }
}

// ============================================================================
// Signature Verifier
// ============================================================================

/// Trust-establishment service over the connection registry, the key
/// registry, and the durable signature store.
pub struct SignatureVerifier<K: KeyRegistry, S: SignatureStore> {
    connections: Arc<ConnectionRegistry>,
    keys: Arc<K>,
    signatures: Arc<S>,
    /// Shared secret the registered key values are encrypted with.
    /// Loaded once per process, immutable afterwards.
    internal_secret: String,
    /// Per-exam statistical threshold overrides.
    thresholds: RwLock<HashMap<ExamId, u64>>,
}

impl<K: KeyRegistry, S: SignatureStore> SignatureVerifier<K, S> {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        keys: Arc<K>,
        signatures: Arc<S>,
        internal_secret: impl Into<String>,
    ) -> Self {
        Self {
            connections,
            keys,
            signatures,
            internal_secret: internal_secret.into(),
            thresholds: RwLock::new(HashMap::new()),
        }
    }

    /// Override the statistical trust threshold for one exam.
    pub async fn set_statistical_threshold(&self, exam_id: ExamId, threshold: u64) {
        self.thresholds.write().await.insert(exam_id, threshold);
    }

    /// Check a connection's app signature and update its grant state.
    ///
    /// Sticky and idempotent: once granted, returns true without
    /// re-evaluating candidates. An unknown connection or a connection with
    /// no submitted and no stored signature yields false, never an error.
    pub async fn check_signature(
        &self,
        connection_token: &str,
        submitted_signature: Option<&str>,
    ) -> Result<bool, SecurityKeyError> {
        let session = match self.connections.session_for(connection_token).await {
            Some(session) => session,
            None => {
                debug!("signature check for unknown connection: {}", connection_token);
                return Ok(false);
            }
        };

        let (institution_id, exam_id) = {
            let state = session.read().await;
            if state.security_check_granted {
                return Ok(true);
            }
            (state.institution_id, state.exam_id)
        };

        // Resolve the ciphertext to check: a fresh submission wins and is
        // persisted (first write only); otherwise fall back to the stored
        // signature for this connection.
        let ciphertext = match submitted_signature {
            Some(submitted) if !submitted.is_empty() => {
                {
                    let mut state = session.write().await;
                    if state.stored_signature.is_none() {
                        state.stored_signature = Some(submitted.to_string());
                    }
                }
                if let Err(error) = self
                    .signatures
                    .put_if_absent(connection_token, submitted)
                    .await
                {
                    warn!(
                        "failed to persist app signature for connection {}: {}",
                        connection_token, error
                    );
                }
                submitted.to_string()
            }
            _ => {
                let stored = session.read().await.stored_signature.clone();
                match stored {
                    Some(cipher) => cipher,
                    None => match self.signatures.get(connection_token).await? {
                        Some(cipher) => {
                            session.write().await.stored_signature = Some(cipher.clone());
                            cipher
                        }
                        // No check possible, no grant.
                        None => return Ok(false),
                    },
                }
            }
        };

        let result = self
            .apply_signature_check(institution_id, exam_id, connection_token, &ciphertext)
            .await?;

        if result.has_any_grant() {
            debug!(
                "app signature grant for connection {}: {:?}",
                connection_token, result
            );
            session.write().await.security_check_granted = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Evaluate a signature ciphertext against registered records, then
    /// statistically against peer connections. Does not touch grant state.
    ///
    /// A failure to decrypt any individual candidate is no match for that
    /// candidate; the check continues across the remaining ones.
    pub async fn apply_signature_check(
        &self,
        institution_id: InstitutionId,
        exam_id: Option<ExamId>,
        connection_token: &str,
        ciphertext: &str,
    ) -> Result<SecurityCheckResult, SecurityKeyError> {
        let plaintext = match decrypt(ciphertext, Some(connection_token)) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(
                    "failed to decrypt submitted app signature for connection {}: {}",
                    connection_token, error
                );
                return Ok(SecurityCheckResult::NO_GRANT);
            }
        };
        let submitted_hash = signature_hash(&plaintext);

        let records = self.keys.all_for(institution_id, exam_id).await?;
        let matches: Vec<&SecurityKeyRecord> = records
            .iter()
            .filter(|record| self.record_matches(record, &submitted_hash))
            .collect();

        if matches.is_empty() {
            Ok(self
                .statistical_check(exam_id, &submitted_hash, connection_token)
                .await)
        } else {
            Ok(SecurityCheckResult {
                exam_grant: matches.iter().any(|r| matches!(r.scope, KeyScope::Exam(_))),
                global_grant: matches.iter().any(|r| r.scope == KeyScope::Global),
                statistical_grant: false,
            })
        }
    }

    /// Whether a registered record's decrypted value hashes to the same
    /// signature. Certificate-encrypted records are never matched.
    fn record_matches(&self, record: &SecurityKeyRecord, submitted_hash: &str) -> bool {
        match record.encryption_type {
            EncryptionType::Certificate => false,
            EncryptionType::InternalPassword => {
                match decrypt(&record.encrypted_value, Some(&self.internal_secret)) {
                    Ok(value) => hashes_equal(&signature_hash(&value), submitted_hash),
                    Err(error) => {
                        debug!(
                            "skipping registered key {} (tag: {}): {}",
                            record.id, record.tag, error
                        );
                        false
                    }
                }
            }
        }
    }

    /// Compare the signature against the stored signatures of every other
    /// active connection in the same exam. O(active connections in exam).
    async fn statistical_check(
        &self,
        exam_id: Option<ExamId>,
        submitted_hash: &str,
        own_token: &str,
    ) -> SecurityCheckResult {
        // If there is no exam known yet, no statistical check can be applied.
        let exam_id = match exam_id {
            Some(id) => id,
            None => return SecurityCheckResult::NO_GRANT,
        };

        let threshold = self
            .thresholds
            .read()
            .await
            .get(&exam_id)
            .copied()
            .unwrap_or(DEFAULT_STATISTICAL_THRESHOLD);

        let mut matches: u64 = 0;
        for token in self.connections.tokens_for(exam_id).await {
            if token == own_token {
                continue;
            }
            if let Some(hash) = self.peer_signature_hash(&token).await {
                if hashes_equal(&hash, submitted_hash) {
                    matches += 1;
                }
            }
        }

        if matches > threshold {
            SecurityCheckResult {
                exam_grant: false,
                global_grant: false,
                statistical_grant: true,
            }
        } else {
            SecurityCheckResult::NO_GRANT
        }
    }

    /// Decrypted signature hash of a peer connection, or `None` when the
    /// peer has no stored signature or its ciphertext does not decrypt.
    async fn peer_signature_hash(&self, token: &str) -> Option<String> {
        let session = self.connections.session_for(token).await?;
        let ciphertext = match session.read().await.stored_signature.clone() {
            Some(cipher) => cipher,
            None => self.signatures.get(token).await.ok().flatten()?,
        };
        match decrypt(&ciphertext, Some(token)) {
            Ok(plaintext) => Some(signature_hash(&plaintext)),
            Err(error) => {
                debug!("skipping peer {} in statistical check: {}", token, error);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Administrative registration surface
    // ------------------------------------------------------------------------

    /// Register the connection's current signature as a globally trusted
    /// key. Decryption failures are reported to the caller.
    pub async fn register_global_key(
        &self,
        institution_id: InstitutionId,
        connection_token: &str,
        tag: &str,
    ) -> Result<SecurityKeyRecord, SecurityKeyError> {
        debug!(
            "register global app-signature-key grant, connection: {} tag: {}",
            connection_token, tag
        );
        self.register_key(institution_id, KeyScope::Global, connection_token, tag)
            .await
    }

    /// Register the connection's current signature as trusted for one exam.
    pub async fn register_exam_key(
        &self,
        institution_id: InstitutionId,
        exam_id: ExamId,
        connection_token: &str,
        tag: &str,
    ) -> Result<SecurityKeyRecord, SecurityKeyError> {
        debug!(
            "register exam app-signature-key grant, exam: {} connection: {} tag: {}",
            exam_id, connection_token, tag
        );
        self.register_key(
            institution_id,
            KeyScope::Exam(exam_id),
            connection_token,
            tag,
        )
        .await
    }

    async fn register_key(
        &self,
        institution_id: InstitutionId,
        scope: KeyScope,
        connection_token: &str,
        tag: &str,
    ) -> Result<SecurityKeyRecord, SecurityKeyError> {
        let session = self
            .connections
            .session_for(connection_token)
            .await
            .ok_or_else(|| SecurityKeyError::UnknownConnection(connection_token.to_string()))?;

        let ciphertext = {
            let state = session.read().await;
            state.stored_signature.clone()
        };
        let ciphertext = match ciphertext {
            Some(cipher) => cipher,
            None => self
                .signatures
                .get(connection_token)
                .await?
                .ok_or_else(|| SecurityKeyError::NoSignature(connection_token.to_string()))?,
        };

        // Re-encrypt under the shared internal secret; failures here are
        // administrator-facing and propagate.
        let plaintext = decrypt(&ciphertext, Some(connection_token))?;
        let encrypted_value = encrypt(&plaintext, Some(&self.internal_secret))?;

        Ok(self
            .keys
            .register(NewSecurityKey {
                institution_id,
                scope,
                encrypted_value,
                encryption_type: EncryptionType::InternalPassword,
                tag: tag.to_string(),
            })
            .await?)
    }

    /// Delete a registered key grant and re-evaluate the active connections
    /// whose stored signature matched it.
    ///
    /// Returns the tokens that no longer pass any check, for flagging by
    /// the monitoring surface. The live grant flag of those connections is
    /// left untouched: a granted security check stays granted for the
    /// connection's lifetime.
    pub async fn delete_key_grant(&self, key_id: KeyId) -> Result<Vec<String>, SecurityKeyError> {
        let record = self.keys.delete(key_id).await?;
        let deleted_hash = match record.encryption_type {
            EncryptionType::InternalPassword => {
                signature_hash(&decrypt(&record.encrypted_value, Some(&self.internal_secret))?)
            }
            EncryptionType::Certificate => return Ok(Vec::new()),
        };

        let tokens = match record.scope {
            KeyScope::Exam(exam_id) => self.connections.tokens_for(exam_id).await,
            KeyScope::Global => self.connections.active_tokens().await,
        };

        let mut unverified = Vec::new();
        for token in tokens {
            let Some(hash) = self.peer_signature_hash(&token).await else {
                continue;
            };
            if !hashes_equal(&hash, &deleted_hash) {
                continue;
            }
            let Some(session) = self.connections.session_for(&token).await else {
                continue;
            };
            let (institution_id, exam_id, ciphertext) = {
                let state = session.read().await;
                (
                    state.institution_id,
                    state.exam_id,
                    state.stored_signature.clone(),
                )
            };
            let Some(ciphertext) = ciphertext else {
                continue;
            };
            let still_granted = self
                .apply_signature_check(institution_id, exam_id, &token, &ciphertext)
                .await
                .map(|r| r.has_any_grant())
                .unwrap_or_else(|error| {
                    warn!("re-check after key deletion failed for {}: {}", token, error);
                    true
                });
            if !still_granted {
                unverified.push(token);
            }
        }
        Ok(unverified)
    }

    /// Group the active connections of an exam by their decrypted signature
    /// hash, for the administrative grant view. Connections whose signature
    /// does not decrypt are skipped.
    pub async fn app_signature_info(
        &self,
        exam_id: ExamId,
    ) -> Result<HashMap<String, Vec<String>>, SecurityKeyError> {
        let mut info: HashMap<String, Vec<String>> = HashMap::new();
        for token in self.connections.tokens_for(exam_id).await {
            if let Some(hash) = self.peer_signature_hash(&token).await {
                info.entry(hash).or_default().push(token);
            }
        }
        Ok(info)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryKeyRegistry, InMemorySignatureStore};

    const INTERNAL_SECRET: &str = "internal-secret";
    const SIGNATURE: &str = "app-signature-plaintext";

    struct Fixture {
        connections: Arc<ConnectionRegistry>,
        verifier: SignatureVerifier<InMemoryKeyRegistry, InMemorySignatureStore>,
    }

    fn fixture() -> Fixture {
        let connections = Arc::new(ConnectionRegistry::new());
        let verifier = SignatureVerifier::new(
            Arc::clone(&connections),
            Arc::new(InMemoryKeyRegistry::new()),
            Arc::new(InMemorySignatureStore::new()),
            INTERNAL_SECRET,
        );
        Fixture {
            connections,
            verifier,
        }
    }

    /// Self-encrypt a signature the way an exam client does.
    fn client_signature(token: &str, plaintext: &str) -> String {
        encrypt(plaintext, Some(token)).unwrap()
    }

    async fn connect(fixture: &Fixture, token: &str, exam_id: Option<ExamId>) {
        fixture.connections.connect(token, 1).await;
        if let Some(exam_id) = exam_id {
            fixture.connections.update_exam(token, exam_id).await;
        }
    }

    async fn register_global(fixture: &Fixture, plaintext: &str) {
        fixture
            .verifier
            .keys
            .register(NewSecurityKey {
                institution_id: 1,
                scope: KeyScope::Global,
                encrypted_value: encrypt(plaintext, Some(INTERNAL_SECRET)).unwrap(),
                encryption_type: EncryptionType::InternalPassword,
                tag: "trusted build".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn global_key_match_grants_and_sticks() {
        let f = fixture();
        connect(&f, "t1", None).await;
        register_global(&f, SIGNATURE).await;

        let submitted = client_signature("t1", SIGNATURE);
        assert!(f.verifier.check_signature("t1", Some(&submitted)).await.unwrap());

        // Sticky: no signature needed on subsequent checks.
        assert!(f.verifier.check_signature("t1", None).await.unwrap());
        assert!(f.verifier.check_signature("t1", Some("")).await.unwrap());
    }

    #[tokio::test]
    async fn classification_global_vs_exam() {
        let f = fixture();
        connect(&f, "t1", Some(9)).await;
        register_global(&f, SIGNATURE).await;

        let submitted = client_signature("t1", SIGNATURE);
        let result = f
            .verifier
            .apply_signature_check(1, Some(9), "t1", &submitted)
            .await
            .unwrap();
        assert!(result.global_grant);
        assert!(!result.exam_grant);
        assert!(!result.statistical_grant);

        f.verifier
            .keys
            .register(NewSecurityKey {
                institution_id: 1,
                scope: KeyScope::Exam(9),
                encrypted_value: encrypt(SIGNATURE, Some(INTERNAL_SECRET)).unwrap(),
                encryption_type: EncryptionType::InternalPassword,
                tag: "exam grant".into(),
            })
            .await
            .unwrap();
        let result = f
            .verifier
            .apply_signature_check(1, Some(9), "t1", &submitted)
            .await
            .unwrap();
        assert!(result.exam_grant);
        assert!(result.global_grant);
    }

    #[tokio::test]
    async fn no_signature_no_grant() {
        let f = fixture();
        connect(&f, "t1", None).await;
        assert!(!f.verifier.check_signature("t1", None).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_connection_is_negative_not_error() {
        let f = fixture();
        assert!(!f.verifier.check_signature("ghost", Some("x")).await.unwrap());
    }

    #[tokio::test]
    async fn undecryptable_submission_is_no_grant() {
        let f = fixture();
        connect(&f, "t1", None).await;
        register_global(&f, SIGNATURE).await;
        // Encrypted with the wrong token.
        let submitted = client_signature("other-token", SIGNATURE);
        assert!(!f.verifier.check_signature("t1", Some(&submitted)).await.unwrap());
    }

    #[tokio::test]
    async fn statistical_grant_above_threshold() {
        let f = fixture();
        for token in ["p1", "p2", "p3"] {
            connect(&f, token, Some(4)).await;
            let cipher = client_signature(token, SIGNATURE);
            f.verifier.check_signature(token, Some(&cipher)).await.unwrap();
        }

        connect(&f, "t4", Some(4)).await;
        let submitted = client_signature("t4", SIGNATURE);
        let result = f
            .verifier
            .apply_signature_check(1, Some(4), "t4", &submitted)
            .await
            .unwrap();
        assert!(result.statistical_grant);
        assert!(!result.exam_grant);
        assert!(!result.global_grant);
        assert!(f.verifier.check_signature("t4", Some(&submitted)).await.unwrap());
    }

    #[tokio::test]
    async fn statistical_no_grant_without_matching_peers() {
        let f = fixture();
        connect(&f, "p1", Some(4)).await;
        let other = client_signature("p1", "different-signature");
        f.verifier.check_signature("p1", Some(&other)).await.unwrap();

        connect(&f, "t2", Some(4)).await;
        let submitted = client_signature("t2", SIGNATURE);
        assert!(!f.verifier.check_signature("t2", Some(&submitted)).await.unwrap());
    }

    #[tokio::test]
    async fn statistical_respects_exam_threshold_override() {
        let f = fixture();
        f.verifier.set_statistical_threshold(4, 3).await;
        for token in ["p1", "p2", "p3"] {
            connect(&f, token, Some(4)).await;
            let cipher = client_signature(token, SIGNATURE);
            f.verifier.check_signature(token, Some(&cipher)).await.unwrap();
        }

        connect(&f, "t4", Some(4)).await;
        let submitted = client_signature("t4", SIGNATURE);
        // 3 matching peers is not strictly greater than 3.
        assert!(!f.verifier.check_signature("t4", Some(&submitted)).await.unwrap());
    }

    #[tokio::test]
    async fn statistical_needs_known_exam() {
        let f = fixture();
        connect(&f, "p1", Some(4)).await;
        let cipher = client_signature("p1", SIGNATURE);
        f.verifier.check_signature("p1", Some(&cipher)).await.unwrap();
        connect(&f, "p2", Some(4)).await;
        let cipher = client_signature("p2", SIGNATURE);
        f.verifier.check_signature("p2", Some(&cipher)).await.unwrap();

        // No exam known for t3 yet; no statistical check possible.
        connect(&f, "t3", None).await;
        let submitted = client_signature("t3", SIGNATURE);
        assert!(!f.verifier.check_signature("t3", Some(&submitted)).await.unwrap());
    }

    #[tokio::test]
    async fn first_signature_write_wins() {
        let f = fixture();
        connect(&f, "t1", None).await;
        let first = client_signature("t1", SIGNATURE);
        let second = client_signature("t1", "another-signature");
        f.verifier.check_signature("t1", Some(&first)).await.unwrap();
        f.verifier.check_signature("t1", Some(&second)).await.unwrap();

        let session = f.connections.session_for("t1").await.unwrap();
        assert_eq!(
            session.read().await.stored_signature.as_deref(),
            Some(first.as_str())
        );
    }

    #[tokio::test]
    async fn register_and_match_via_admin_flow() {
        let f = fixture();
        connect(&f, "t1", Some(2)).await;
        let cipher = client_signature("t1", SIGNATURE);
        f.verifier.check_signature("t1", Some(&cipher)).await.unwrap();

        let record = f
            .verifier
            .register_exam_key(1, 2, "t1", "room 12")
            .await
            .unwrap();
        assert_eq!(record.scope, KeyScope::Exam(2));

        // A fresh connection with the same signature now matches the
        // registered record.
        connect(&f, "t2", Some(2)).await;
        let submitted = client_signature("t2", SIGNATURE);
        let result = f
            .verifier
            .apply_signature_check(1, Some(2), "t2", &submitted)
            .await
            .unwrap();
        assert!(result.exam_grant);
    }

    #[tokio::test]
    async fn register_without_signature_is_reported() {
        let f = fixture();
        connect(&f, "t1", None).await;
        let result = f.verifier.register_global_key(1, "t1", "tag").await;
        assert!(matches!(result, Err(SecurityKeyError::NoSignature(_))));

        let result = f.verifier.register_global_key(1, "ghost", "tag").await;
        assert!(matches!(result, Err(SecurityKeyError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn delete_key_grant_reports_unverified_but_keeps_sticky_flag() {
        let f = fixture();
        connect(&f, "t1", Some(2)).await;
        let cipher = client_signature("t1", SIGNATURE);
        f.verifier.check_signature("t1", Some(&cipher)).await.unwrap();
        let record = f.verifier.register_exam_key(1, 2, "t1", "lab").await.unwrap();

        assert!(f.verifier.check_signature("t1", None).await.unwrap());

        let unverified = f.verifier.delete_key_grant(record.id).await.unwrap();
        assert_eq!(unverified, vec!["t1".to_string()]);

        // Sticky grant holds for the connection's lifetime.
        assert!(f.verifier.check_signature("t1", None).await.unwrap());
    }

    #[tokio::test]
    async fn end_to_end_global_grant_scenario() {
        let f = fixture();
        register_global(&f, SIGNATURE).await;
        connect(&f, "t1", None).await;

        let submitted = client_signature("t1", SIGNATURE);
        let result = f
            .verifier
            .apply_signature_check(1, None, "t1", &submitted)
            .await
            .unwrap();
        assert!(result.global_grant && !result.exam_grant && !result.statistical_grant);

        assert!(f.verifier.check_signature("t1", Some(&submitted)).await.unwrap());
        assert!(f.verifier.check_signature("t1", None).await.unwrap());
    }

    #[tokio::test]
    async fn app_signature_info_groups_by_hash() {
        let f = fixture();
        for token in ["a", "b"] {
            connect(&f, token, Some(3)).await;
            let cipher = client_signature(token, SIGNATURE);
            f.verifier.check_signature(token, Some(&cipher)).await.unwrap();
        }
        connect(&f, "c", Some(3)).await;
        let cipher = client_signature("c", "other");
        f.verifier.check_signature("c", Some(&cipher)).await.unwrap();

        let info = f.verifier.app_signature_info(3).await.unwrap();
        assert_eq!(info.len(), 2);
        let shared = info.get(&signature_hash(SIGNATURE)).unwrap();
        assert_eq!(shared.len(), 2);
    }
}
