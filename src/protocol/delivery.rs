//! Chunk delivery orchestration.
//!
//! [`ChunkDeliveryService`] wires the session store, token authority, abuse
//! detector, key manager, and origin boundary into the five protocol
//! operations: metadata grants, chunk delivery, plain ranged delivery, key
//! sessions, and teardown. Validation always runs to completion before any
//! state is advanced; the only mutation on the chunk path is the final
//! compare-and-swap, so failed and raced requests leave sessions exactly as
//! they found them.

use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

use crate::modules::chunk_crypto::{derive_chunk_key, encrypt_chunk, generate_seed};
use crate::modules::metrics::{DeliveryEvent, DeliveryMetrics, SessionEndReason};
use crate::modules::origin::OriginStore;

use super::clock::Clock;
use super::config::ProtocolConfig;
use super::error::DeliveryError;
use super::keys::{KeyManager, KeySet};
use super::ledger::AbuseDetector;
use super::session::{SessionStatus, SessionStore, StreamingSession};
use super::token::{chain_link, ChunkClaims, IssuedToken, TokenAuthority};

/// Longest accepted client fingerprint.
const MAX_FINGERPRINT_LEN: usize = 256;

/// Inputs for a metadata grant.
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub user_id: String,
    pub video_id: String,
    pub fingerprint: String,
    pub want_encryption: bool,
    pub client_key: String,
    pub user_agent: Option<String>,
}

/// A freshly admitted session with its bootstrap token.
#[derive(Debug, Clone)]
pub struct MetadataGrant {
    pub session: StreamingSession,
    pub bootstrap_token: IssuedToken,
}

/// Inputs for one chunk request.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub session_id: String,
    pub video_id: String,
    pub chunk_index: u64,
    pub fingerprint: String,
    pub previous_hash: Option<String>,
    pub token: String,
    pub client_key: String,
}

/// Chunk bytes, sealed or clear depending on the session policy.
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    Clear(Bytes),
    Encrypted { ciphertext: Vec<u8>, iv: [u8; 12] },
}

/// One delivered chunk with the credentials for the next request.
#[derive(Debug, Clone)]
pub struct ChunkDelivery {
    pub payload: ChunkPayload,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub content_type: String,
    pub next_token: IssuedToken,
    pub next_hash: String,
}

/// Inputs for a plain ranged request.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub video_id: String,
    pub start: u64,
    pub end: Option<u64>,
    pub client_key: String,
    pub user_agent: Option<String>,
}

/// A served byte range.
#[derive(Debug, Clone)]
pub struct RangeDelivery {
    pub body: Bytes,
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
    pub content_type: String,
}

/// Byte span of a chunk within the asset, end inclusive.
fn chunk_span(index: u64, chunk_size: u64, total_size: u64) -> (u64, u64) {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(total_size) - 1;
    (start, end)
}

/// The delivery pipeline.
pub struct ChunkDeliveryService {
    config: ProtocolConfig,
    clock: Arc<dyn Clock>,
    sessions: SessionStore,
    tokens: TokenAuthority,
    abuse: AbuseDetector,
    keys: KeyManager,
    origin: Arc<dyn OriginStore>,
    metrics: Arc<DeliveryMetrics>,
}

impl ChunkDeliveryService {
    pub fn new(
        config: ProtocolConfig,
        clock: Arc<dyn Clock>,
        origin: Arc<dyn OriginStore>,
        token_secret: &[u8],
    ) -> Self {
        let sessions = SessionStore::new(config.inactivity_timeout_secs);
        let tokens = TokenAuthority::new(token_secret, config.token_ttl_secs, clock.clone());
        let abuse = AbuseDetector::new(config.clone());
        let keys = KeyManager::new(config.keys_per_session, config.key_rotation_secs);
        ChunkDeliveryService {
            config,
            clock,
            sessions,
            tokens,
            abuse,
            keys,
            origin,
            metrics: Arc::new(DeliveryMetrics::new()),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn abuse(&self) -> &AbuseDetector {
        &self.abuse
    }

    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        self.metrics.clone()
    }

    /// Resolve a video, admit a session, and hand out the bootstrap token.
    ///
    /// Nothing is stored when any step refuses, so a rejected client leaves
    /// no per-session state behind.
    pub async fn issue_metadata(
        &self,
        req: MetadataRequest,
    ) -> Result<MetadataGrant, DeliveryError> {
        let now = self.clock.now();

        // 1. Request hygiene
        validate_identity(&req.user_id, &req.video_id)?;
        if req.fingerprint.is_empty() || req.fingerprint.len() > MAX_FINGERPRINT_LEN {
            return Err(DeliveryError::InvalidRequest {
                reason: "fingerprint must be 1-256 characters".to_string(),
            });
        }

        // 2. Client signature screen
        self.abuse
            .screen_agent(req.user_agent.as_deref())
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 3. Probe the asset
        let object = self
            .origin
            .resolve(&req.video_id)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 4. Build the session record
        let session = StreamingSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            video_id: req.video_id.clone(),
            fingerprint: req.fingerprint.clone(),
            origin_ref: object.origin_ref,
            created_at: now,
            expires_at: now + self.config.session_ttl_secs,
            last_activity_at: now,
            chunk_size: self.config.chunk_size,
            total_size: object.total_size,
            total_chunks: object.total_size.div_ceil(self.config.chunk_size),
            content_type: object.content_type,
            chunks_delivered: 0,
            last_chunk_hash: None,
            encryption_seed: req.want_encryption.then(generate_seed),
            status: SessionStatus::Created,
            auth_failures: 0,
        };

        // 5. Admit under the per-(user, video) cap
        self.sessions
            .create(session.clone(), self.config.max_concurrent_streams, now)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 6. Bootstrap token authorizes chunk 0
        let bootstrap_token =
            self.tokens
                .issue(&req.user_id, &req.video_id, &req.fingerprint, 0)?;

        self.metrics.record_session_start();
        self.metrics.log_event(&DeliveryEvent::SessionStart {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            video_id: session.video_id.clone(),
            client_key: req.client_key.clone(),
            encrypted: session.encryption_seed.is_some(),
            total_chunks: session.total_chunks,
            timestamp: now,
        });

        Ok(MetadataGrant {
            session,
            bootstrap_token,
        })
    }

    /// Serve one chunk.
    pub async fn deliver_chunk(&self, req: ChunkRequest) -> Result<ChunkDelivery, DeliveryError> {
        let now = self.clock.now();

        // 1. Request cap, before any token work
        self.abuse
            .authorize_chunk(&req.client_key, &req.video_id, now)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 2. Token: signature, video binding, fingerprint, freshness, index
        let claims = match self.tokens.validate(
            &req.token,
            &req.video_id,
            &req.fingerprint,
            req.chunk_index,
        ) {
            Ok(claims) => claims,
            Err(e) => return Err(self.auth_failed(&req, e).await),
        };

        // 3. Session state
        let session = self.validate_session(&req, &claims, now).await?;

        // 4. Sequence position: exactly the next undelivered chunk
        if req.chunk_index >= session.total_chunks
            || req.chunk_index != session.chunks_delivered
        {
            let err = DeliveryError::InvalidSequence {
                requested: req.chunk_index,
                expected: session.chunks_delivered,
            };
            return Err(self.auth_failed(&req, err).await);
        }

        // 5. Hash chain continuity
        if let Some(server_hash) = &session.last_chunk_hash {
            let client_hash = req.previous_hash.as_deref().unwrap_or("");
            if client_hash != server_hash {
                let err = DeliveryError::HashMismatch {
                    client: client_hash.to_string(),
                    server: server_hash.clone(),
                };
                return Err(self.auth_failed(&req, err).await);
            }
        }

        // 6. Fetch from origin with no session lock held; a failure here
        // leaves the counter untouched, so the client can retry the same
        // chunk with the same token
        let (start, end) = chunk_span(req.chunk_index, session.chunk_size, session.total_size);
        let body = self
            .origin
            .fetch_range(&session.origin_ref, start, end)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;
        let body_len = body.len() as u64;

        // 7. Seal when the session negotiated encryption
        let payload = match &session.encryption_seed {
            Some(seed) => {
                let key = derive_chunk_key(seed, &session.fingerprint);
                let (iv, ciphertext) = encrypt_chunk(&key, &body)?;
                ChunkPayload::Encrypted { ciphertext, iv }
            }
            None => ChunkPayload::Clear(body),
        };

        // 8. Credentials for the next request
        let next_index = req.chunk_index + 1;
        let next_hash = chain_link(next_index, &session.video_id, &session.fingerprint, now);
        let next_token =
            self.tokens
                .issue(&claims.sub, &session.video_id, &session.fingerprint, next_index)?;

        // 9. Publish progress; losing the swap means a duplicate already won
        if !self
            .sessions
            .try_advance(&req.session_id, req.chunk_index, next_hash.clone(), now)
            .await
        {
            let expected = self
                .sessions
                .get(&req.session_id)
                .await
                .map(|s| s.chunks_delivered)
                .unwrap_or(next_index);
            let err = DeliveryError::InvalidSequence {
                requested: req.chunk_index,
                expected,
            };
            return Err(self.denied(&req.video_id, &req.client_key, err));
        }

        self.metrics.record_chunk(body_len);
        debug!(
            "Delivered chunk {}/{} of session {} ({} bytes)",
            next_index, session.total_chunks, req.session_id, body_len
        );
        if next_index == session.total_chunks {
            self.metrics.log_event(&DeliveryEvent::SessionEnd {
                session_id: session.session_id.clone(),
                user_id: session.user_id.clone(),
                video_id: session.video_id.clone(),
                chunks_delivered: session.total_chunks,
                reason: SessionEndReason::Completed,
                timestamp: now,
            });
        }

        Ok(ChunkDelivery {
            payload,
            chunk_index: req.chunk_index,
            total_chunks: session.total_chunks,
            content_type: session.content_type,
            next_token,
            next_hash,
        })
    }

    /// Serve a plain byte range with the full abuse battery applied.
    pub async fn stream_range(&self, req: RangeRequest) -> Result<RangeDelivery, DeliveryError> {
        let now = self.clock.now();

        // 1. Signature screen before anything is probed or fetched
        self.abuse
            .screen_agent(req.user_agent.as_deref())
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 2. Resolve so range math has the asset size
        let object = self
            .origin
            .resolve(&req.video_id)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 3. Clamp the range
        if req.start >= object.total_size {
            let err = DeliveryError::RangeNotSatisfiable {
                start: req.start,
                size: object.total_size,
            };
            return Err(self.denied(&req.video_id, &req.client_key, err));
        }
        let end = req
            .end
            .unwrap_or(object.total_size - 1)
            .min(object.total_size - 1);
        if end < req.start {
            return Err(DeliveryError::InvalidRequest {
                reason: "range end precedes range start".to_string(),
            });
        }
        let length = end - req.start + 1;

        // 4. Ledger accounting and heuristics
        self.abuse
            .authorize_range(
                &req.client_key,
                &req.video_id,
                req.user_agent.as_deref(),
                req.start,
                length,
                object.total_size,
                now,
            )
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        // 5. Fetch and pass through
        let body = self
            .origin
            .fetch_range(&object.origin_ref, req.start, end)
            .await
            .map_err(|e| self.denied(&req.video_id, &req.client_key, e))?;

        self.metrics.record_chunk(body.len() as u64);
        Ok(RangeDelivery {
            body,
            start: req.start,
            end,
            total_size: object.total_size,
            content_type: object.content_type,
        })
    }

    /// Explicit client teardown; frees the concurrency slot immediately.
    pub async fn teardown(&self, session_id: &str) -> Result<(), DeliveryError> {
        match self.sessions.remove(session_id).await {
            Some(session) => {
                info!(
                    "Session {} torn down by client after {} chunks",
                    session_id, session.chunks_delivered
                );
                self.metrics.log_event(&DeliveryEvent::SessionEnd {
                    session_id: session.session_id,
                    user_id: session.user_id,
                    video_id: session.video_id,
                    chunks_delivered: session.chunks_delivered,
                    reason: SessionEndReason::UserTerminated,
                    timestamp: self.clock.now(),
                });
                Ok(())
            }
            None => Err(DeliveryError::SessionTimeout {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Issue a rotating key session for (user, video).
    pub async fn issue_key_session(
        &self,
        user_id: &str,
        video_id: &str,
        client_key: &str,
        user_agent: Option<&str>,
    ) -> Result<KeySet, DeliveryError> {
        let now = self.clock.now();

        validate_identity(user_id, video_id)?;
        self.abuse
            .screen_agent(user_agent)
            .map_err(|e| self.denied(video_id, client_key, e))?;
        self.origin
            .resolve(video_id)
            .await
            .map_err(|e| self.denied(video_id, client_key, e))?;

        let set = self
            .keys
            .create_key_session(user_id, video_id, self.config.max_concurrent_streams, now)
            .await
            .map_err(|e| self.denied(video_id, client_key, e))?;

        self.metrics.record_key_session();
        self.metrics.log_event(&DeliveryEvent::KeySessionIssued {
            session_id: set.session_id.clone(),
            user_id: user_id.to_string(),
            video_id: video_id.to_string(),
            key_count: set.keys.len(),
            timestamp: now,
        });
        Ok(set)
    }

    /// Hand out one content key after re-validating the token exchange and
    /// the client's abuse standing.
    pub async fn fetch_key(
        &self,
        key_id: &str,
        video_id: &str,
        token: &str,
        client_key: &str,
    ) -> Result<[u8; 32], DeliveryError> {
        let now = self.clock.now();

        // 1. Request cap shared with the chunk path
        self.abuse
            .authorize_chunk(client_key, video_id, now)
            .await
            .map_err(|e| self.denied(video_id, client_key, e))?;

        // 2. Proof of a live token exchange
        let claims: ChunkClaims = self
            .tokens
            .inspect_fresh(token, video_id)
            .map_err(|e| self.denied(video_id, client_key, e))?;

        // 3. Ownership and per-key expiry
        let material = self
            .keys
            .fetch_key(key_id, video_id, &claims.sub, now)
            .await
            .map_err(|e| self.denied(video_id, client_key, e))?;

        self.metrics.record_key_served();
        Ok(material)
    }

    /// Session checks shared by the chunk path: existence, identity
    /// bindings, and liveness.
    async fn validate_session(
        &self,
        req: &ChunkRequest,
        claims: &ChunkClaims,
        now: i64,
    ) -> Result<StreamingSession, DeliveryError> {
        let Some(session) = self.sessions.get(&req.session_id).await else {
            let err = DeliveryError::SessionTimeout {
                session_id: req.session_id.clone(),
            };
            return Err(self.denied(&req.video_id, &req.client_key, err));
        };

        if session.user_id != claims.sub || session.video_id != req.video_id {
            let err = DeliveryError::InvalidToken {
                reason: "token was not issued for this session".to_string(),
            };
            return Err(self.auth_failed(req, err).await);
        }
        if session.fingerprint != req.fingerprint {
            return Err(self.auth_failed(req, DeliveryError::FingerprintMismatch).await);
        }

        if session.status.is_terminal()
            || now > session.expires_at
            || now - session.last_activity_at > self.config.inactivity_timeout_secs
        {
            // first touch of a timed-out session flips it and emits the end
            // event; later touches and already-terminal sessions stay quiet
            if self.sessions.expire(&req.session_id).await {
                self.metrics.log_event(&DeliveryEvent::SessionEnd {
                    session_id: session.session_id.clone(),
                    user_id: session.user_id.clone(),
                    video_id: session.video_id.clone(),
                    chunks_delivered: session.chunks_delivered,
                    reason: SessionEndReason::Timeout,
                    timestamp: now,
                });
            }
            let err = DeliveryError::SessionTimeout {
                session_id: req.session_id.clone(),
            };
            return Err(self.denied(&req.video_id, &req.client_key, err));
        }

        Ok(session)
    }

    /// Record an authorization failure against the session and abort it once
    /// the failure budget is spent.
    async fn auth_failed(&self, req: &ChunkRequest, err: DeliveryError) -> DeliveryError {
        if err.is_auth_failure() {
            let failures = self.sessions.record_auth_failure(&req.session_id).await;
            if failures >= self.config.max_auth_failures {
                self.sessions.abort(&req.session_id).await;
                if let Some(session) = self.sessions.get(&req.session_id).await {
                    self.metrics.log_event(&DeliveryEvent::SessionEnd {
                        session_id: session.session_id,
                        user_id: session.user_id,
                        video_id: session.video_id,
                        chunks_delivered: session.chunks_delivered,
                        reason: SessionEndReason::Aborted,
                        timestamp: self.clock.now(),
                    });
                }
            }
        }
        self.denied(&req.video_id, &req.client_key, err)
    }

    /// Account for a denial and emit the access-denied event.
    fn denied(&self, video_id: &str, client_key: &str, err: DeliveryError) -> DeliveryError {
        self.metrics.record_denial(&err);
        self.metrics.log_event(&DeliveryEvent::AccessDenied {
            video_id: video_id.to_string(),
            client_key: client_key.to_string(),
            code: err.code().to_string(),
            timestamp: self.clock.now(),
        });
        err
    }
}

fn validate_identity(user_id: &str, video_id: &str) -> Result<(), DeliveryError> {
    if user_id.is_empty() || video_id.is_empty() {
        return Err(DeliveryError::InvalidRequest {
            reason: "user and video identifiers are required".to_string(),
        });
    }
    Ok(())
}
