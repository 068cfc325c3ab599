//! Per-client request accounting and bulk-download heuristics.
//!
//! Each (client, video) pair gets an [`AccessLedger`] tracking a request
//! window and the recent range starts. Denials are evaluated in a fixed
//! order: hard request cap, sequential-scan pattern, oversized range. The
//! client-signature screen runs before any state is touched.
//!
//! The chunked path is throttled by the request cap alone; chunk requests
//! are sequential by construction, so the pattern heuristic would flag
//! every legitimate player. The plain ranged path gets the full battery.

use log::warn;
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::config::ProtocolConfig;
use super::error::DeliveryError;

/// User-agent fragments associated with bulk download tooling.
static BULK_CLIENT_MARKERS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "curl",
        "wget",
        "aria2",
        "youtube-dl",
        "yt-dlp",
        "python-requests",
        "python-urllib",
        "go-http-client",
        "okhttp",
        "httrack",
        "axel",
    ]
});

/// One observed range request.
#[derive(Debug, Clone, Copy)]
struct RangeSample {
    start: u64,
    at: i64,
}

/// Request history for one (client, video) pair.
#[derive(Debug)]
pub struct AccessLedger {
    first_seen_at: i64,
    last_request_at: i64,
    window_started_at: i64,
    window_count: u32,
    ranges: VecDeque<RangeSample>,
}

impl AccessLedger {
    fn new(now: i64) -> Self {
        AccessLedger {
            first_seen_at: now,
            last_request_at: now,
            window_started_at: now,
            window_count: 0,
            ranges: VecDeque::new(),
        }
    }

    /// Count a request against the window, restarting the window once it is
    /// a full `window_secs` old.
    fn note(&mut self, now: i64, window_secs: i64) {
        if now - self.window_started_at >= window_secs {
            self.window_started_at = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        self.last_request_at = now;
    }

    fn push_range(&mut self, start: u64, at: i64, history_cap: usize) {
        self.ranges.push_back(RangeSample { start, at });
        while self.ranges.len() > history_cap {
            self.ranges.pop_front();
        }
    }

    /// Whether the recent range starts look like a front-to-back scan of the
    /// asset: mostly ascending in small steps, sustained across the window.
    fn sequential_pattern(&self, cfg: &ProtocolConfig) -> bool {
        if self.ranges.len() <= cfg.pattern_min_history
            || self.window_count <= cfg.pattern_min_window_count
        {
            return false;
        }

        let skip = self.ranges.len().saturating_sub(cfg.pattern_sample);
        let tail: Vec<RangeSample> = self.ranges.iter().skip(skip).copied().collect();
        let steps = tail.len() - 1;
        if steps == 0 {
            return false;
        }

        let mut sequential = 0usize;
        for pair in tail.windows(2) {
            let gap_forward = pair[1].start > pair[0].start;
            if gap_forward && pair[1].start - pair[0].start <= cfg.pattern_gap_bytes {
                sequential += 1;
            }
        }
        sequential as f64 / steps as f64 > cfg.pattern_sequential_fraction
    }
}

/// Tracks request ledgers and evaluates abuse heuristics.
#[derive(Clone)]
pub struct AbuseDetector {
    ledgers: Arc<RwLock<HashMap<(String, String), AccessLedger>>>,
    config: ProtocolConfig,
}

impl AbuseDetector {
    pub fn new(config: ProtocolConfig) -> Self {
        AbuseDetector {
            ledgers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Reject clients whose signature matches the bulk-downloader denylist.
    pub fn screen_agent(&self, user_agent: Option<&str>) -> Result<(), DeliveryError> {
        let Some(agent) = user_agent else {
            return Ok(());
        };
        let lowered = agent.to_ascii_lowercase();
        if BULK_CLIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
            warn!("Denied client signature: {}", agent);
            return Err(DeliveryError::SuspiciousClient);
        }
        Ok(())
    }

    /// Gate one chunk-protocol request: request cap only.
    pub async fn authorize_chunk(
        &self,
        client_key: &str,
        video_id: &str,
        now: i64,
    ) -> Result<(), DeliveryError> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers
            .entry((client_key.to_string(), video_id.to_string()))
            .or_insert_with(|| AccessLedger::new(now));
        ledger.note(now, self.config.window_secs);
        self.check_window(ledger, client_key, video_id)
    }

    /// Gate one plain ranged request: signature screen, request cap,
    /// sequential pattern, oversized range, in that order. The request is
    /// recorded before evaluation so it counts against itself.
    pub async fn authorize_range(
        &self,
        client_key: &str,
        video_id: &str,
        user_agent: Option<&str>,
        range_start: u64,
        range_len: u64,
        asset_size: u64,
        now: i64,
    ) -> Result<(), DeliveryError> {
        self.screen_agent(user_agent)?;

        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers
            .entry((client_key.to_string(), video_id.to_string()))
            .or_insert_with(|| AccessLedger::new(now));
        ledger.note(now, self.config.window_secs);
        ledger.push_range(range_start, now, self.config.ledger_history_cap);

        self.check_window(ledger, client_key, video_id)?;

        if ledger.sequential_pattern(&self.config) {
            warn!(
                "Sequential download pattern from {} on video {} ({} ranged requests)",
                client_key, video_id, ledger.window_count
            );
            return Err(DeliveryError::DownloadPatternDetected);
        }

        let limit = self.config.oversize_limit(asset_size);
        if range_len > limit {
            warn!(
                "Oversized range from {} on video {}: {} bytes (limit {})",
                client_key, video_id, range_len, limit
            );
            return Err(DeliveryError::LargeRangeRequest {
                length: range_len,
                limit,
            });
        }

        Ok(())
    }

    fn check_window(
        &self,
        ledger: &AccessLedger,
        client_key: &str,
        video_id: &str,
    ) -> Result<(), DeliveryError> {
        if ledger.window_count > self.config.window_max_requests {
            warn!(
                "Request cap exceeded by {} on video {}: {} in window",
                client_key, video_id, ledger.window_count
            );
            return Err(DeliveryError::ExcessiveRequests {
                count: ledger.window_count,
                cap: self.config.window_max_requests,
            });
        }
        Ok(())
    }

    /// Drop ledgers idle past the idle timeout or older than the hard age
    /// cap. Returns the number removed.
    pub async fn sweep(&self, now: i64) -> usize {
        let mut ledgers = self.ledgers.write().await;
        let before = ledgers.len();
        ledgers.retain(|_, ledger| {
            now - ledger.last_request_at <= self.config.ledger_idle_secs
                && now - ledger.first_seen_at <= self.config.ledger_max_age_secs
        });
        before - ledgers.len()
    }

    pub async fn len(&self) -> usize {
        self.ledgers.read().await.len()
    }
}
