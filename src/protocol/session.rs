//! Streaming session records and the in-process session store.
//!
//! The store owns every live [`StreamingSession`] behind per-record locks.
//! All protocol progress flows through [`SessionStore::try_advance`], a
//! compare-and-swap on the delivered-chunk counter, so two requests for the
//! same chunk can never both succeed.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::DeliveryError;

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Streaming,
    Completed,
    Expired,
    Aborted,
}

impl SessionStatus {
    /// Terminal states accept no further chunk requests.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Aborted
        )
    }
}

/// State for one client streaming one video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSession {
    pub session_id: String,
    pub user_id: String,
    pub video_id: String,
    /// Stable digest of client characteristics, bound at creation.
    pub fingerprint: String,
    /// Locator the origin store resolved for this video.
    pub origin_ref: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_activity_at: i64,
    pub chunk_size: u64,
    pub total_size: u64,
    pub total_chunks: u64,
    pub content_type: String,
    /// Count of chunks delivered so far; also the next index to serve.
    pub chunks_delivered: u64,
    /// Hash-chain link issued with the most recent chunk.
    pub last_chunk_hash: Option<String>,
    /// Per-session key seed, present only when the client asked for
    /// encrypted delivery.
    pub encryption_seed: Option<String>,
    pub status: SessionStatus,
    /// Failed authorization attempts against this session.
    pub auth_failures: u32,
}

impl StreamingSession {
    /// Whether the session can still accept chunk requests at `now`.
    pub fn is_live(&self, now: i64, inactivity_timeout: i64) -> bool {
        !self.status.is_terminal()
            && now <= self.expires_at
            && (now - self.last_activity_at) <= inactivity_timeout
    }
}

/// Shared registry of live streaming sessions.
///
/// The outer map lock is held briefly for lookup and membership changes;
/// per-session locks serialize state transitions on one session without
/// blocking the rest.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<RwLock<StreamingSession>>>>>,
    inactivity_timeout: i64,
}

impl SessionStore {
    pub fn new(inactivity_timeout_secs: i64) -> Self {
        SessionStore {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            inactivity_timeout: inactivity_timeout_secs,
        }
    }

    /// Admit a new session, enforcing the per-(user, video) concurrency cap.
    ///
    /// The count and the insert happen under one write lock on the map, so
    /// two racing creates cannot both observe a free slot.
    pub async fn create(
        &self,
        session: StreamingSession,
        cap: usize,
        now: i64,
    ) -> Result<(), DeliveryError> {
        let mut sessions = self.sessions.write().await;

        let mut active = 0;
        for entry in sessions.values() {
            let s = entry.read().await;
            if s.user_id == session.user_id
                && s.video_id == session.video_id
                && s.is_live(now, self.inactivity_timeout)
            {
                active += 1;
            }
        }
        if active >= cap {
            warn!(
                "Concurrency cap hit for user {} on video {}: {}/{}",
                session.user_id, session.video_id, active, cap
            );
            return Err(DeliveryError::ConcurrentStreamLimit { active, cap });
        }

        info!(
            "Created session {} for user {} on video {} ({} chunks)",
            session.session_id, session.user_id, session.video_id, session.total_chunks
        );
        sessions.insert(
            session.session_id.clone(),
            Arc::new(RwLock::new(session)),
        );
        Ok(())
    }

    /// Snapshot of a session, if present.
    pub async fn get(&self, session_id: &str) -> Option<StreamingSession> {
        let handle = self.handle(session_id).await?;
        let session = handle.read().await;
        Some(session.clone())
    }

    /// Compare-and-swap advance of the delivered-chunk counter.
    ///
    /// Succeeds only when the session is live and exactly `expected` chunks
    /// have been delivered; on success records the new chain hash, refreshes
    /// activity, and walks the status machine. Any other outcome leaves the
    /// session untouched.
    pub async fn try_advance(
        &self,
        session_id: &str,
        expected: u64,
        new_hash: String,
        now: i64,
    ) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut session = handle.write().await;

        if !session.is_live(now, self.inactivity_timeout) || session.chunks_delivered != expected {
            return false;
        }

        session.chunks_delivered += 1;
        session.last_chunk_hash = Some(new_hash);
        session.last_activity_at = now;
        if session.status == SessionStatus::Created {
            session.status = SessionStatus::Streaming;
        }
        if session.chunks_delivered >= session.total_chunks {
            session.status = SessionStatus::Completed;
            info!(
                "Session {} completed: {} chunks delivered",
                session.session_id, session.chunks_delivered
            );
        }
        true
    }

    /// Count a failed authorization attempt; returns the running total.
    pub async fn record_auth_failure(&self, session_id: &str) -> u32 {
        let Some(handle) = self.handle(session_id).await else {
            return 0;
        };
        let mut session = handle.write().await;
        session.auth_failures += 1;
        session.auth_failures
    }

    /// Force a session into the aborted state.
    pub async fn abort(&self, session_id: &str) {
        if let Some(handle) = self.handle(session_id).await {
            let mut session = handle.write().await;
            if !session.status.is_terminal() {
                warn!(
                    "Aborting session {} after {} authorization failures",
                    session.session_id, session.auth_failures
                );
                session.status = SessionStatus::Aborted;
            }
        }
    }

    /// Mark a session expired unless it is already terminal. Returns whether
    /// this call performed the transition, so the caller can emit the end
    /// event exactly once.
    pub async fn expire(&self, session_id: &str) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut session = handle.write().await;
        if session.status.is_terminal() {
            return false;
        }
        session.status = SessionStatus::Expired;
        true
    }

    /// Remove a session outright, returning its final state.
    pub async fn remove(&self, session_id: &str) -> Option<StreamingSession> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)?
        };
        let session = entry.read().await;
        Some(session.clone())
    }

    /// Remove every session that is past its lifetime, idle past the
    /// inactivity timeout, or terminal, with `grace` seconds of slack so an
    /// in-flight accepted request is not raced. Returns the number removed.
    pub async fn sweep_expired(&self, now: i64, grace: i64) -> usize {
        let mut sessions = self.sessions.write().await;

        let mut stale = Vec::new();
        for (id, entry) in sessions.iter() {
            let s = entry.read().await;
            let past_ttl = now > s.expires_at + grace;
            let past_idle = now > s.last_activity_at + self.inactivity_timeout + grace;
            let finished = s.status.is_terminal() && now > s.last_activity_at + grace;
            if past_ttl || past_idle || finished {
                stale.push(id.clone());
            }
        }

        for id in &stale {
            if let Some(entry) = sessions.remove(id) {
                let mut s = entry.write().await;
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Expired;
                }
                info!("Swept session {} ({:?})", s.session_id, s.status);
            }
        }
        stale.len()
    }

    /// Live sessions for a (user, video) pair.
    pub async fn live_count(&self, user_id: &str, video_id: &str, now: i64) -> usize {
        let sessions = self.sessions.read().await;
        let mut active = 0;
        for entry in sessions.values() {
            let s = entry.read().await;
            if s.user_id == user_id
                && s.video_id == video_id
                && s.is_live(now, self.inactivity_timeout)
            {
                active += 1;
            }
        }
        active
    }

    /// Total sessions held, live or not.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn handle(&self, session_id: &str) -> Option<Arc<RwLock<StreamingSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }
}
