//! Error types for chunk delivery and session validation.

use thiserror::Error;

/// Errors that can occur while authorizing and serving chunk requests.
///
/// Every variant carries a stable wire code (see [`DeliveryError::code`]) so
/// clients can branch on machine-readable values while the `Display` text
/// stays free to change.
#[derive(Debug, Error)]
pub enum DeliveryError {
    // ---- authorization failures ----
    #[error("Invalid authorization token: {reason}")]
    InvalidToken { reason: String },

    #[error("Token issued at {issued_at} is stale at {now}")]
    TokenExpired { issued_at: i64, now: i64 },

    #[error("Client fingerprint does not match the session binding")]
    FingerprintMismatch,

    #[error("Chunk {requested} requested, chunk {expected} is next in sequence")]
    InvalidSequence { requested: u64, expected: u64 },

    #[error("Hash chain mismatch: client presented {client}, server recorded {server}")]
    HashMismatch { client: String, server: String },

    #[error("Session {session_id} not found or expired")]
    SessionTimeout { session_id: String },

    // ---- rate and abuse denials ----
    #[error("Request rate exceeded: {count} requests in the current window (cap {cap})")]
    ExcessiveRequests { count: u32, cap: u32 },

    #[error("Sequential bulk-download pattern detected")]
    DownloadPatternDetected,

    #[error("Requested range of {length} bytes exceeds the per-request limit of {limit}")]
    LargeRangeRequest { length: u64, limit: u64 },

    #[error("Client signature matches a known bulk downloader")]
    SuspiciousClient,

    #[error("Requested range starting at {start} is outside the {size} byte asset")]
    RangeNotSatisfiable { start: u64, size: u64 },

    // ---- concurrency ----
    #[error("Concurrent stream limit reached: {active} active (cap {cap})")]
    ConcurrentStreamLimit { active: usize, cap: usize },

    // ---- key access ----
    #[error("Key access denied: {reason}")]
    KeyAccessDenied { reason: String },

    // ---- origin failures (transient, retry-safe) ----
    #[error("Unknown video: {video_id}")]
    UnknownVideo { video_id: String },

    #[error("Origin fetch failed: {reason}")]
    OriginUnavailable { reason: String },

    // ---- integrity failures ----
    #[error("Chunk decryption failed: authentication tag rejected")]
    DecryptFailed,

    // ---- request and server faults ----
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Stable machine-readable code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken { .. } => "INVALID_TOKEN",
            Self::TokenExpired { .. } => "TOKEN_EXPIRED",
            Self::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            Self::InvalidSequence { .. } => "INVALID_SEQUENCE",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::SessionTimeout { .. } => "SESSION_TIMEOUT",
            Self::ExcessiveRequests { .. } => "EXCESSIVE_REQUESTS",
            Self::DownloadPatternDetected => "DOWNLOAD_PATTERN_DETECTED",
            Self::LargeRangeRequest { .. } => "LARGE_RANGE_REQUEST",
            Self::SuspiciousClient => "SUSPICIOUS_CLIENT",
            Self::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            Self::ConcurrentStreamLimit { .. } => "CONCURRENT_STREAM_LIMIT",
            Self::KeyAccessDenied { .. } => "KEY_ACCESS_DENIED",
            Self::UnknownVideo { .. } => "UNKNOWN_VIDEO",
            Self::OriginUnavailable { .. } => "ORIGIN_UNAVAILABLE",
            Self::DecryptFailed => "DECRYPT_FAILED",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this failure counts toward a session's authorization failure
    /// budget. Rate denials and origin faults do not implicate the token
    /// exchange, so they never push a session toward abort.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidToken { .. }
                | Self::TokenExpired { .. }
                | Self::FingerprintMismatch
                | Self::InvalidSequence { .. }
                | Self::HashMismatch { .. }
        )
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::OriginUnavailable {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = DeliveryError::InvalidSequence {
            requested: 7,
            expected: 3,
        };
        assert_eq!(err.code(), "INVALID_SEQUENCE");

        let err = DeliveryError::SessionTimeout {
            session_id: "s-1".to_string(),
        };
        assert_eq!(err.code(), "SESSION_TIMEOUT");

        let err = DeliveryError::HashMismatch {
            client: "aa".to_string(),
            server: "bb".to_string(),
        };
        assert_eq!(err.code(), "HASH_MISMATCH");
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(DeliveryError::FingerprintMismatch.is_auth_failure());
        assert!(DeliveryError::TokenExpired {
            issued_at: 0,
            now: 31
        }
        .is_auth_failure());
        assert!(!DeliveryError::DownloadPatternDetected.is_auth_failure());
        assert!(!DeliveryError::OriginUnavailable {
            reason: "timeout".to_string()
        }
        .is_auth_failure());
    }
}
