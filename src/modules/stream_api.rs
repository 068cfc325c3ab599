//! HTTP surface for the chunked delivery protocol.
//!
//! Thin axum handlers over [`ChunkDeliveryService`]: they lift identity and
//! credentials out of headers, hand the work to the service, and shape the
//! result for the wire. Every policy decision lives in the service layer.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::modules::metrics::MetricsSnapshot;
use crate::protocol::delivery::{
    ChunkDeliveryService, ChunkPayload, ChunkRequest, MetadataRequest, RangeRequest,
};
use crate::protocol::error::DeliveryError;

/// Shared state for the stream API endpoints
pub struct StreamApiState {
    pub delivery: ChunkDeliveryService,
}

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub video_id: String,
    pub fingerprint: String,
    #[serde(default)]
    pub want_encryption: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub video_id: String,
    pub total_size_bytes: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub content_type: String,
    pub encrypted: bool,
    /// Key seed for encrypted sessions; the chunk key is derived from this
    /// and the client fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_seed: Option<String>,
    pub session_expires_at: i64,
    pub bootstrap_token: String,
    pub token_expires_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkBody {
    pub session_id: String,
    pub video_id: String,
    pub chunk_index: u64,
    pub fingerprint: String,
    pub previous_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedChunkResponse {
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub ciphertext: String, // Base64 (GCM tag appended)
    pub iv: String,         // Base64
    pub next_token: String,
    pub next_hash: String,
    /// Freshness deadline of `next_token`.
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySessionRequest {
    pub video_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySessionResponse {
    pub session_id: String,
    pub video_id: String,
    pub key_rotation_interval: i64,
    /// Seconds until the longest-lived key lapses.
    pub expires_in: i64,
    pub keys: Vec<KeyDescriptor>,
}

/// Key listing entry; never carries the key material itself.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDescriptor {
    pub key_id: String,
    pub key_index: u32,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFetchRequest {
    pub key_id: String,
    pub video_id: String,
    /// A live chunk token for the same video, proving an active exchange.
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl From<DeliveryError> for ErrorResponse {
    fn from(err: DeliveryError) -> Self {
        ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "INVALID_TOKEN" | "TOKEN_EXPIRED" => StatusCode::UNAUTHORIZED,
            "FINGERPRINT_MISMATCH" | "SESSION_TIMEOUT" | "SUSPICIOUS_CLIENT"
            | "KEY_ACCESS_DENIED" => StatusCode::FORBIDDEN,
            "INVALID_SEQUENCE" | "HASH_MISMATCH" => StatusCode::CONFLICT,
            "UNKNOWN_VIDEO" => StatusCode::NOT_FOUND,
            "RANGE_NOT_SATISFIABLE" => StatusCode::RANGE_NOT_SATISFIABLE,
            "EXCESSIVE_REQUESTS" | "DOWNLOAD_PATTERN_DETECTED" | "LARGE_RANGE_REQUEST"
            | "CONCURRENT_STREAM_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
            "ORIGIN_UNAVAILABLE" => StatusCode::BAD_GATEWAY,
            "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

// ==================== Helper Functions ====================

/// Caller identity from the `x-user-id` header.
fn require_user_id(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    match headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(ErrorResponse::from(DeliveryError::InvalidRequest {
            reason: "missing x-user-id header".to_string(),
        })),
    }
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Chunk token from the `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ErrorResponse::from(DeliveryError::InvalidToken {
                reason: "missing bearer token".to_string(),
            })
        })
}

/// Parse a `bytes=start-end` range header value; the end may be open.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        Some((start, None))
    } else {
        Some((start, Some(end.parse().ok()?)))
    }
}

// ==================== Handlers ====================

/// Start a streaming session and return the chunk map with the bootstrap
/// token.
pub async fn start_session(
    State(state): State<Arc<StreamApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ErrorResponse> {
    let user_id = require_user_id(&headers)?;

    let grant = state
        .delivery
        .issue_metadata(MetadataRequest {
            user_id,
            video_id: payload.video_id,
            fingerprint: payload.fingerprint,
            want_encryption: payload.want_encryption,
            client_key: addr.ip().to_string(),
            user_agent: user_agent(&headers),
        })
        .await?;

    let session = grant.session;
    Ok(Json(StartSessionResponse {
        session_id: session.session_id,
        video_id: session.video_id,
        total_size_bytes: session.total_size,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        content_type: session.content_type,
        encrypted: session.encryption_seed.is_some(),
        encryption_seed: session.encryption_seed,
        session_expires_at: session.expires_at,
        bootstrap_token: grant.bootstrap_token.token,
        token_expires_at: grant.bootstrap_token.expires_at,
    }))
}

/// Serve one chunk. Encrypted sessions get a JSON envelope with Base64
/// ciphertext; clear sessions get raw bytes with the next-request
/// credentials in response headers.
pub async fn deliver_chunk(
    State(state): State<Arc<StreamApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ChunkBody>,
) -> Result<Response, ErrorResponse> {
    let token = bearer_token(&headers)?;

    let delivery = state
        .delivery
        .deliver_chunk(ChunkRequest {
            session_id: payload.session_id,
            video_id: payload.video_id,
            chunk_index: payload.chunk_index,
            fingerprint: payload.fingerprint,
            previous_hash: payload.previous_hash,
            token,
            client_key: addr.ip().to_string(),
        })
        .await?;

    let response = match delivery.payload {
        ChunkPayload::Encrypted { ciphertext, iv } => Json(EncryptedChunkResponse {
            chunk_index: delivery.chunk_index,
            total_chunks: delivery.total_chunks,
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
            next_token: delivery.next_token.token,
            next_hash: delivery.next_hash,
            expires_at: delivery.next_token.expires_at,
        })
        .into_response(),
        ChunkPayload::Clear(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, delivery.content_type),
                (header::CACHE_CONTROL, "no-store".to_string()),
                (
                    HeaderName::from_static("x-chunk-index"),
                    delivery.chunk_index.to_string(),
                ),
                (
                    HeaderName::from_static("x-total-chunks"),
                    delivery.total_chunks.to_string(),
                ),
                (
                    HeaderName::from_static("next-token"),
                    delivery.next_token.token,
                ),
                (HeaderName::from_static("next-hash"), delivery.next_hash),
                (
                    HeaderName::from_static("expires-at"),
                    delivery.next_token.expires_at.to_string(),
                ),
            ],
            body,
        )
            .into_response(),
    };
    Ok(response)
}

/// Plain ranged delivery. A `Range` header is required; whole-file requests
/// are refused so every download stays piecemeal.
pub async fn stream_video(
    State(state): State<Arc<StreamApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(video_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ErrorResponse> {
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ErrorResponse::from(DeliveryError::InvalidRequest {
                reason: "a bytes range header is required".to_string(),
            })
        })?;
    let (start, end) = parse_range(range_header).ok_or_else(|| {
        ErrorResponse::from(DeliveryError::InvalidRequest {
            reason: format!("unsupported range header: {}", range_header),
        })
    })?;

    let delivery = state
        .delivery
        .stream_range(RangeRequest {
            video_id,
            start,
            end,
            client_key: addr.ip().to_string(),
            user_agent: user_agent(&headers),
        })
        .await?;

    let content_range = format!(
        "bytes {}-{}/{}",
        delivery.start, delivery.end, delivery.total_size
    );
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_TYPE, delivery.content_type),
            (header::CONTENT_RANGE, content_range),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        delivery.body,
    )
        .into_response())
}

/// Issue a rotating key session for the caller.
pub async fn create_key_session(
    State(state): State<Arc<StreamApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<KeySessionRequest>,
) -> Result<Json<KeySessionResponse>, ErrorResponse> {
    let user_id = require_user_id(&headers)?;

    let set = state
        .delivery
        .issue_key_session(
            &user_id,
            &payload.video_id,
            &addr.ip().to_string(),
            user_agent(&headers).as_deref(),
        )
        .await?;

    let expires_in = set.expires_at() - set.created_at;
    Ok(Json(KeySessionResponse {
        session_id: set.session_id,
        video_id: set.video_id,
        key_rotation_interval: state.delivery.config().key_rotation_secs,
        expires_in,
        keys: set
            .keys
            .iter()
            .map(|k| KeyDescriptor {
                key_id: k.key_id.clone(),
                key_index: k.key_index,
                created_at: k.created_at,
                expires_at: k.expires_at,
            })
            .collect(),
    }))
}

/// Hand out one content key as raw bytes. The proof token travels in the
/// body so the request never leaks it into access logs as a header.
pub async fn fetch_key(
    State(state): State<Arc<StreamApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<KeyFetchRequest>,
) -> Result<Response, ErrorResponse> {
    let material = state
        .delivery
        .fetch_key(
            &payload.key_id,
            &payload.video_id,
            &payload.token,
            &addr.ip().to_string(),
        )
        .await?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        material.to_vec(),
    )
        .into_response())
}

/// Tear down a session on client request.
pub async fn teardown_session(
    State(state): State<Arc<StreamApiState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ErrorResponse> {
    state.delivery.teardown(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Counter snapshot for operators.
pub async fn stats(State(state): State<Arc<StreamApiState>>) -> Json<MetricsSnapshot> {
    Json(state.delivery.metrics().snapshot())
}

// ==================== Router ====================

/// All protocol routes under `/stream/v1`.
pub fn stream_routes(state: Arc<StreamApiState>) -> Router {
    Router::new()
        .route("/stream/v1/metadata", post(start_session))
        .route("/stream/v1/chunk", post(deliver_chunk))
        .route("/stream/v1/video/:video_id", get(stream_video))
        .route("/stream/v1/keys", post(create_key_session))
        .route("/stream/v1/key", post(fetch_key))
        .route("/stream/v1/session/:session_id", delete(teardown_session))
        .route("/stream/v1/stats", get(stats))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_statuses() {
        let cases = [
            (
                DeliveryError::InvalidToken {
                    reason: "garbled".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                DeliveryError::TokenExpired {
                    issued_at: 0,
                    now: 60,
                },
                StatusCode::UNAUTHORIZED,
            ),
            (DeliveryError::FingerprintMismatch, StatusCode::FORBIDDEN),
            (
                DeliveryError::SessionTimeout {
                    session_id: "s-1".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                DeliveryError::InvalidSequence {
                    requested: 4,
                    expected: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::HashMismatch {
                    client: "aa".to_string(),
                    server: "bb".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::ExcessiveRequests { count: 51, cap: 50 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                DeliveryError::ConcurrentStreamLimit { active: 2, cap: 2 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                DeliveryError::UnknownVideo {
                    video_id: "v-404".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                DeliveryError::RangeNotSatisfiable { start: 9, size: 5 },
                StatusCode::RANGE_NOT_SATISFIABLE,
            ),
            (
                DeliveryError::OriginUnavailable {
                    reason: "connection refused".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DeliveryError::InvalidRequest {
                    reason: "empty".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                DeliveryError::Internal("broken".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let code = err.code();
            let response = ErrorResponse::from(err).into_response();
            assert_eq!(response.status(), expected, "code {}", code);
        }
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-1023"), Some((0, Some(1023))));
        assert_eq!(parse_range("bytes=500-"), Some((500, None)));
        assert_eq!(parse_range(" bytes=2048-4095 "), Some((2048, Some(4095))));
        assert_eq!(parse_range("bytes=abc-"), None);
        assert_eq!(parse_range("0-100"), None);
        assert_eq!(parse_range("bytes=-500"), None);
    }
}
