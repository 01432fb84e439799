//! Shared identifier types.

/// Institution identifier.
pub type InstitutionId = i64;

/// Exam identifier. Unknown until the client handshake completes.
pub type ExamId = i64;

/// Registered security key identifier.
pub type KeyId = i64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
