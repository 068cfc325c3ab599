/// End-to-end walks of the chunk protocol against an in-memory origin:
/// ordered delivery, duplicate and out-of-order handling, fingerprint
/// binding, hash-chain tampering, and session timeouts under a manual
/// clock.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use streamlock::modules::chunk_crypto::{decrypt_chunk, derive_chunk_key};
use streamlock::modules::origin::{MemoryOriginStore, OriginObject, OriginStore};
use streamlock::protocol::clock::ManualClock;
use streamlock::protocol::config::ProtocolConfig;
use streamlock::protocol::delivery::{
    ChunkDeliveryService, ChunkPayload, ChunkRequest, MetadataRequest,
};
use streamlock::protocol::error::DeliveryError;
use streamlock::protocol::session::SessionStatus;

const SECRET: &[u8] = b"integration-test-signing-secret!";
const CHUNK: u64 = 64 * 1024;
const FINGERPRINT: &str = "fp-device-1";

fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        chunk_size: CHUNK,
        ..ProtocolConfig::default()
    }
}

fn patterned(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 249) as u8).collect::<Vec<u8>>())
}

async fn service_with_asset(
    config: ProtocolConfig,
    clock: Arc<ManualClock>,
    video_id: &str,
    size: usize,
) -> ChunkDeliveryService {
    let origin = MemoryOriginStore::new();
    origin.insert(video_id, patterned(size), "video/mp4").await;
    ChunkDeliveryService::new(config, clock, Arc::new(origin), SECRET)
}

fn metadata_request(user: &str, video: &str, encrypted: bool) -> MetadataRequest {
    MetadataRequest {
        user_id: user.to_string(),
        video_id: video.to_string(),
        fingerprint: FINGERPRINT.to_string(),
        want_encryption: encrypted,
        client_key: "10.0.0.1".to_string(),
        user_agent: Some("StreamLockPlayer/1.0".to_string()),
    }
}

fn chunk_request(
    session_id: &str,
    video: &str,
    index: u64,
    token: &str,
    previous_hash: Option<String>,
) -> ChunkRequest {
    ChunkRequest {
        session_id: session_id.to_string(),
        video_id: video.to_string(),
        chunk_index: index,
        fingerprint: FINGERPRINT.to_string(),
        previous_hash,
        token: token.to_string(),
        client_key: "10.0.0.1".to_string(),
    }
}

#[tokio::test]
async fn test_full_encrypted_stream_reassembles() {
    let clock = Arc::new(ManualClock::at(1_000));
    let size = 10 * CHUNK as usize - 512;
    let service = service_with_asset(test_config(), clock.clone(), "v-1", size).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", true))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();
    assert_eq!(grant.session.total_chunks, 10);

    let seed = grant.session.encryption_seed.clone().unwrap();
    let key = derive_chunk_key(&seed, FINGERPRINT);

    let mut token = grant.bootstrap_token.token.clone();
    let mut previous_hash: Option<String> = None;
    let mut recovered = Vec::new();

    for index in 0..10u64 {
        // playback pacing
        clock.advance(2);
        let delivery = service
            .deliver_chunk(chunk_request(
                &session_id,
                "v-1",
                index,
                &token,
                previous_hash.clone(),
            ))
            .await
            .unwrap();

        assert_eq!(delivery.chunk_index, index);
        match delivery.payload {
            ChunkPayload::Encrypted { ciphertext, iv } => {
                let clear = decrypt_chunk(&key, &iv, &ciphertext).unwrap();
                recovered.extend_from_slice(&clear);
            }
            ChunkPayload::Clear(_) => panic!("session negotiated encryption"),
        }
        token = delivery.next_token.token;
        previous_hash = Some(delivery.next_hash);
    }

    assert_eq!(recovered, patterned(size).to_vec());

    let session = service.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.chunks_delivered, 10);

    // the finished session accepts nothing further
    let err = service
        .deliver_chunk(chunk_request(&session_id, "v-1", 10, &token, previous_hash))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_TIMEOUT");
}

#[tokio::test]
async fn test_clear_session_walks_in_the_clear() {
    let clock = Arc::new(ManualClock::at(1_000));
    let size = 3 * CHUNK as usize;
    let service = service_with_asset(test_config(), clock.clone(), "v-1", size).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    assert!(grant.session.encryption_seed.is_none());
    let session_id = grant.session.session_id.clone();

    let mut token = grant.bootstrap_token.token.clone();
    let mut previous_hash = None;
    let mut recovered = Vec::new();
    for index in 0..3u64 {
        let delivery = service
            .deliver_chunk(chunk_request(&session_id, "v-1", index, &token, previous_hash))
            .await
            .unwrap();
        match delivery.payload {
            ChunkPayload::Clear(body) => recovered.extend_from_slice(&body),
            ChunkPayload::Encrypted { .. } => panic!("session did not negotiate encryption"),
        }
        token = delivery.next_token.token;
        previous_hash = Some(delivery.next_hash);
    }
    assert_eq!(recovered, patterned(size).to_vec());
}

#[tokio::test]
async fn test_duplicate_requests_admit_exactly_one_winner() {
    let clock = Arc::new(ManualClock::at(1_000));
    let size = 10 * CHUNK as usize;
    let service = Arc::new(service_with_asset(test_config(), clock.clone(), "v-1", size).await);

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    // walk to chunk 3
    let mut token = grant.bootstrap_token.token.clone();
    let mut previous_hash = None;
    for index in 0..3u64 {
        let delivery = service
            .deliver_chunk(chunk_request(&session_id, "v-1", index, &token, previous_hash))
            .await
            .unwrap();
        token = delivery.next_token.token;
        previous_hash = Some(delivery.next_hash);
    }

    // four identical requests for chunk 3 race
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let request = chunk_request(&session_id, "v-1", 3, &token, previous_hash.clone());
        tasks.push(tokio::spawn(
            async move { service.deliver_chunk(request).await },
        ));
    }

    let mut winner = None;
    let mut losses = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(delivery) => {
                assert!(winner.is_none(), "two requests for the same chunk succeeded");
                winner = Some(delivery);
            }
            Err(e) => {
                assert_eq!(e.code(), "INVALID_SEQUENCE");
                losses += 1;
            }
        }
    }
    let winner = winner.expect("no request for chunk 3 succeeded");
    assert_eq!(losses, 3);

    // the session stays healthy and finishes from the winner's credentials
    let mut token = winner.next_token.token;
    let mut previous_hash = Some(winner.next_hash);
    for index in 4..10u64 {
        let delivery = service
            .deliver_chunk(chunk_request(&session_id, "v-1", index, &token, previous_hash))
            .await
            .unwrap();
        token = delivery.next_token.token;
        previous_hash = Some(delivery.next_hash);
    }
    let session = service.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_replayed_token_is_single_use() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();
    let bootstrap = grant.bootstrap_token.token.clone();

    service
        .deliver_chunk(chunk_request(&session_id, "v-1", 0, &bootstrap, None))
        .await
        .unwrap();

    // replaying the consumed bootstrap token cannot rewind the stream
    let err = service
        .deliver_chunk(chunk_request(&session_id, "v-1", 0, &bootstrap, None))
        .await
        .unwrap_err();
    match err {
        DeliveryError::InvalidSequence {
            requested,
            expected,
        } => {
            assert_eq!(requested, 0);
            assert_eq!(expected, 1);
        }
        other => panic!("expected InvalidSequence, got {:?}", other),
    }
}

#[tokio::test]
async fn test_skipping_ahead_is_rejected() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 6 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    // the bootstrap token only authorizes chunk 0
    let err = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            3,
            &grant.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap_err();
    match err {
        DeliveryError::InvalidSequence {
            requested,
            expected,
        } => {
            assert_eq!(requested, 3);
            assert_eq!(expected, 0);
        }
        other => panic!("expected InvalidSequence, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fingerprint_swap_is_rejected_mid_stream() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    let delivery = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            0,
            &grant.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap();

    // a different device presents the stolen token and hash
    let mut stolen = chunk_request(
        &session_id,
        "v-1",
        1,
        &delivery.next_token.token,
        Some(delivery.next_hash.clone()),
    );
    stolen.fingerprint = "fp-other-device".to_string();
    let err = service.deliver_chunk(stolen).await.unwrap_err();
    assert_eq!(err.code(), "FINGERPRINT_MISMATCH");

    // the legitimate holder continues unharmed
    service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            1,
            &delivery.next_token.token,
            Some(delivery.next_hash),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stolen_token_fails_on_another_users_session() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let victim = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let thief = service
        .issue_metadata(metadata_request("u-2", "v-1", false))
        .await
        .unwrap();

    // the thief presents the victim's token against their own session
    let err = service
        .deliver_chunk(chunk_request(
            &thief.session.session_id,
            "v-1",
            0,
            &victim.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TOKEN");
}

#[tokio::test]
async fn test_tampered_hash_chain_aborts_after_budget() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 6 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    let delivery = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            0,
            &grant.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap();

    // five straight forged hashes exhaust the failure budget
    for _ in 0..5 {
        let err = service
            .deliver_chunk(chunk_request(
                &session_id,
                "v-1",
                1,
                &delivery.next_token.token,
                Some("0".repeat(64)),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HASH_MISMATCH");
    }

    let session = service.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(session.auth_failures, 5);

    // even the correct hash is refused now
    let err = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            1,
            &delivery.next_token.token,
            Some(delivery.next_hash.clone()),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_TIMEOUT");
}

#[tokio::test]
async fn test_token_freshness_window() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    // 31 seconds of dithering: the bootstrap token has gone stale
    clock.advance(31);
    let err = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            0,
            &grant.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_EXPIRED");
}

#[tokio::test]
async fn test_inactivity_timeout_closes_the_session() {
    let clock = Arc::new(ManualClock::at(1_000));
    // inactivity shorter than token freshness so the session check decides
    let config = ProtocolConfig {
        chunk_size: CHUNK,
        inactivity_timeout_secs: 20,
        ..ProtocolConfig::default()
    };
    let service = service_with_asset(config, clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    let delivery = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            0,
            &grant.bootstrap_token.token,
            None,
        ))
        .await
        .unwrap();

    clock.advance(25);
    let err = service
        .deliver_chunk(chunk_request(
            &session_id,
            "v-1",
            1,
            &delivery.next_token.token,
            Some(delivery.next_hash),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_TIMEOUT");
}

#[tokio::test]
async fn test_session_hard_ttl_caps_even_active_streams() {
    let clock = Arc::new(ManualClock::at(1_000));
    let config = ProtocolConfig {
        chunk_size: CHUNK,
        session_ttl_secs: 120,
        ..ProtocolConfig::default()
    };
    let service = service_with_asset(config, clock.clone(), "v-1", 10 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();
    assert_eq!(grant.session.expires_at, 1_120);

    // stream steadily, never idle, never letting a token lapse
    let mut token = grant.bootstrap_token.token.clone();
    let mut previous_hash = None;
    for index in 0..5u64 {
        let delivery = service
            .deliver_chunk(chunk_request(&session_id, "v-1", index, &token, previous_hash))
            .await
            .unwrap();
        token = delivery.next_token.token;
        previous_hash = Some(delivery.next_hash);
        clock.advance(25);
    }

    // 125 seconds in, the absolute lifetime has passed
    let err = service
        .deliver_chunk(chunk_request(&session_id, "v-1", 5, &token, previous_hash))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_TIMEOUT");
}

// ==================== Origin fault injection ====================

struct FlakyOrigin {
    inner: MemoryOriginStore,
    fail_next_fetch: AtomicBool,
}

impl FlakyOrigin {
    async fn with_asset(video_id: &str, data: Bytes) -> Self {
        let inner = MemoryOriginStore::new();
        inner.insert(video_id, data, "video/mp4").await;
        FlakyOrigin {
            inner,
            fail_next_fetch: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OriginStore for FlakyOrigin {
    async fn resolve(&self, video_id: &str) -> Result<OriginObject, DeliveryError> {
        self.inner.resolve(video_id).await
    }

    async fn fetch_range(
        &self,
        origin_ref: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, DeliveryError> {
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(DeliveryError::OriginUnavailable {
                reason: "origin connection reset".to_string(),
            });
        }
        self.inner.fetch_range(origin_ref, start, end).await
    }
}

#[tokio::test]
async fn test_origin_failure_is_retryable_with_the_same_token() {
    let clock = Arc::new(ManualClock::at(1_000));
    let origin = Arc::new(FlakyOrigin::with_asset("v-1", patterned(4 * CHUNK as usize)).await);
    let service =
        ChunkDeliveryService::new(test_config(), clock.clone(), origin.clone(), SECRET);

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();
    let bootstrap = grant.bootstrap_token.token.clone();

    origin.fail_next_fetch.store(true, Ordering::SeqCst);
    let err = service
        .deliver_chunk(chunk_request(&session_id, "v-1", 0, &bootstrap, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ORIGIN_UNAVAILABLE");

    // nothing advanced and nothing was held against the session
    let session = service.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.chunks_delivered, 0);
    assert_eq!(session.auth_failures, 0);

    // the same token succeeds on retry
    service
        .deliver_chunk(chunk_request(&session_id, "v-1", 0, &bootstrap, None))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_teardown_frees_the_session() {
    let clock = Arc::new(ManualClock::at(1_000));
    let service = service_with_asset(test_config(), clock.clone(), "v-1", 4 * CHUNK as usize).await;

    let grant = service
        .issue_metadata(metadata_request("u-1", "v-1", false))
        .await
        .unwrap();
    let session_id = grant.session.session_id.clone();

    service.teardown(&session_id).await.unwrap();
    assert!(service.sessions().get(&session_id).await.is_none());

    // tearing down twice reports the session gone
    let err = service.teardown(&session_id).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_TIMEOUT");
}
