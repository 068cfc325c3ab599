//! Delivery counters and analytics events.
//!
//! Counters are plain atomics snapshotted on demand; events are structured
//! records emitted to the log stream for downstream collection.

use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::error::DeliveryError;

/// Analytics events emitted by the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    SessionStart {
        session_id: String,
        user_id: String,
        video_id: String,
        client_key: String,
        encrypted: bool,
        total_chunks: u64,
        timestamp: i64,
    },
    SessionEnd {
        session_id: String,
        user_id: String,
        video_id: String,
        chunks_delivered: u64,
        reason: SessionEndReason,
        timestamp: i64,
    },
    AccessDenied {
        video_id: String,
        client_key: String,
        code: String,
        timestamp: i64,
    },
    KeySessionIssued {
        session_id: String,
        user_id: String,
        video_id: String,
        key_count: usize,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    UserTerminated,
    Completed,
    Timeout,
    Aborted,
}

/// Counter totals since process start.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub chunks_delivered: u64,
    pub bytes_delivered: u64,
    pub auth_failures: u64,
    pub rate_denials: u64,
    pub concurrency_denials: u64,
    pub origin_errors: u64,
    pub key_sessions_issued: u64,
    pub keys_served: u64,
    pub records_swept: u64,
}

/// Process-wide delivery metrics.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    sessions_started: AtomicU64,
    chunks_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    auth_failures: AtomicU64,
    rate_denials: AtomicU64,
    concurrency_denials: AtomicU64,
    origin_errors: AtomicU64,
    key_sessions_issued: AtomicU64,
    keys_served: AtomicU64,
    records_swept: AtomicU64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        DeliveryMetrics::default()
    }

    pub fn record_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, bytes: u64) {
        self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_key_session(&self) {
        self.key_sessions_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_served(&self) {
        self.keys_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, removed: usize) {
        self.records_swept.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Bucket a denial into the counter its taxonomy class owns.
    pub fn record_denial(&self, error: &DeliveryError) {
        let counter = match error {
            e if e.is_auth_failure() => &self.auth_failures,
            DeliveryError::ExcessiveRequests { .. }
            | DeliveryError::DownloadPatternDetected
            | DeliveryError::LargeRangeRequest { .. }
            | DeliveryError::SuspiciousClient => &self.rate_denials,
            DeliveryError::ConcurrentStreamLimit { .. } => &self.concurrency_denials,
            DeliveryError::OriginUnavailable { .. } | DeliveryError::UnknownVideo { .. } => {
                &self.origin_errors
            }
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_denials: self.rate_denials.load(Ordering::Relaxed),
            concurrency_denials: self.concurrency_denials.load(Ordering::Relaxed),
            origin_errors: self.origin_errors.load(Ordering::Relaxed),
            key_sessions_issued: self.key_sessions_issued.load(Ordering::Relaxed),
            keys_served: self.keys_served.load(Ordering::Relaxed),
            records_swept: self.records_swept.load(Ordering::Relaxed),
        }
    }

    /// Emit an event as a structured log line.
    pub fn log_event(&self, event: &DeliveryEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "streamlock::events", "{}", json),
            Err(e) => error!("Failed to serialize delivery event: {}", e),
        }
    }
}
