//! Origin storage boundary.
//!
//! The delivery pipeline only ever asks two things of the origin tier:
//! resolve a video id to an object (size and content type included), and
//! fetch a byte range of that object. Everything behind that seam, HTTP
//! origin or in-memory fixture, is interchangeable.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::error::DeliveryError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A resolved origin object.
#[derive(Debug, Clone)]
pub struct OriginObject {
    /// Opaque locator for later range fetches.
    pub origin_ref: String,
    pub total_size: u64,
    pub content_type: String,
}

/// Boundary to the origin storage tier.
#[async_trait]
pub trait OriginStore: Send + Sync {
    /// Map a video id to its origin object, probing size and content type.
    async fn resolve(&self, video_id: &str) -> Result<OriginObject, DeliveryError>;

    /// Fetch the inclusive byte range `start..=end` of an origin object.
    async fn fetch_range(
        &self,
        origin_ref: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, DeliveryError>;
}

/// Origin store backed by an HTTP object host that honors range requests.
#[derive(Clone)]
pub struct HttpOriginStore {
    client: Client,
    base_url: String,
}

impl HttpOriginStore {
    /// # Panics
    ///
    /// Panics if the `reqwest::Client` builder fails to build.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .build()
            .expect("failed to build reqwest client");
        HttpOriginStore {
            client,
            base_url: base_url.into(),
        }
    }

    fn object_url(&self, video_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), video_id)
    }
}

#[async_trait]
impl OriginStore for HttpOriginStore {
    async fn resolve(&self, video_id: &str) -> Result<OriginObject, DeliveryError> {
        let url = self.object_url(video_id);
        let resp = self.client.head(&url).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DeliveryError::UnknownVideo {
                video_id: video_id.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(DeliveryError::OriginUnavailable {
                reason: format!("probe of {} returned {}", url, resp.status()),
            });
        }

        let total_size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| DeliveryError::OriginUnavailable {
                reason: format!("origin did not report a size for {}", url),
            })?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        debug!("Resolved {} to {} ({} bytes)", video_id, url, total_size);
        Ok(OriginObject {
            origin_ref: url,
            total_size,
            content_type,
        })
    }

    async fn fetch_range(
        &self,
        origin_ref: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, DeliveryError> {
        let resp = self
            .client
            .get(origin_ref)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?;

        let status = resp.status();
        let expected = end - start + 1;
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let body = resp.bytes().await?;
                if body.len() as u64 != expected {
                    return Err(DeliveryError::OriginUnavailable {
                        reason: format!(
                            "short range read from {}: {} of {} bytes",
                            origin_ref,
                            body.len(),
                            expected
                        ),
                    });
                }
                Ok(body)
            }
            // hosts without range support return the whole object; slice it
            StatusCode::OK => {
                let body = resp.bytes().await?;
                if (body.len() as u64) < end + 1 {
                    return Err(DeliveryError::OriginUnavailable {
                        reason: format!(
                            "full read from {} is shorter than the requested range",
                            origin_ref
                        ),
                    });
                }
                Ok(body.slice(start as usize..=end as usize))
            }
            _ => Err(DeliveryError::OriginUnavailable {
                reason: format!("range fetch from {} returned {}", origin_ref, status),
            }),
        }
    }
}

/// In-memory origin store for tests and self-contained deployments.
#[derive(Clone, Default)]
pub struct MemoryOriginStore {
    assets: Arc<RwLock<HashMap<String, MemoryAsset>>>,
}

#[derive(Debug, Clone)]
struct MemoryAsset {
    data: Bytes,
    content_type: String,
}

impl MemoryOriginStore {
    pub fn new() -> Self {
        MemoryOriginStore::default()
    }

    pub async fn insert(&self, video_id: &str, data: Bytes, content_type: &str) {
        let mut assets = self.assets.write().await;
        assets.insert(
            video_id.to_string(),
            MemoryAsset {
                data,
                content_type: content_type.to_string(),
            },
        );
    }
}

#[async_trait]
impl OriginStore for MemoryOriginStore {
    async fn resolve(&self, video_id: &str) -> Result<OriginObject, DeliveryError> {
        let assets = self.assets.read().await;
        let asset = assets
            .get(video_id)
            .ok_or_else(|| DeliveryError::UnknownVideo {
                video_id: video_id.to_string(),
            })?;
        Ok(OriginObject {
            origin_ref: video_id.to_string(),
            total_size: asset.data.len() as u64,
            content_type: asset.content_type.clone(),
        })
    }

    async fn fetch_range(
        &self,
        origin_ref: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, DeliveryError> {
        let assets = self.assets.read().await;
        let asset = assets
            .get(origin_ref)
            .ok_or_else(|| DeliveryError::UnknownVideo {
                video_id: origin_ref.to_string(),
            })?;
        let len = asset.data.len() as u64;
        if start >= len || end >= len || start > end {
            return Err(DeliveryError::Internal(format!(
                "range {}-{} outside {} byte asset",
                start, end, len
            )));
        }
        Ok(asset.data.slice(start as usize..=end as usize))
    }
}
