//! Tunable protocol thresholds.
//!
//! Every timeout and heuristic threshold the delivery pipeline consults lives
//! here rather than in scattered constants, so deployments can tighten or
//! loosen enforcement without a rebuild.

use std::env;

/// Default chunk size served to clients (1 MiB)
const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default session lifetime (4 hours)
const DEFAULT_SESSION_TTL: i64 = 4 * 60 * 60;

/// Default inactivity timeout (5 minutes)
const DEFAULT_INACTIVITY_TIMEOUT: i64 = 300;

/// Protocol and enforcement tunables.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Bytes served per chunk; the final chunk may be shorter.
    pub chunk_size: u64,
    /// Seconds a chunk authorization token stays fresh after issue.
    pub token_ttl_secs: i64,
    /// Hard session lifetime in seconds.
    pub session_ttl_secs: i64,
    /// Seconds of silence after which a session is considered dead.
    pub inactivity_timeout_secs: i64,
    /// Extra seconds an expired record survives before the sweeper removes it.
    pub sweep_grace_secs: i64,
    /// Seconds between sweeper passes.
    pub sweep_interval_secs: u64,
    /// Live sessions allowed per (user, video) pair.
    pub max_concurrent_streams: usize,
    /// Authorization failures tolerated before a session is aborted.
    pub max_auth_failures: u32,

    /// Sliding request window length in seconds.
    pub window_secs: i64,
    /// Requests allowed per window per (client, video) before denial.
    pub window_max_requests: u32,
    /// Range samples required before the pattern heuristic runs.
    pub pattern_min_history: usize,
    /// Range samples the pattern heuristic inspects (most recent first).
    pub pattern_sample: usize,
    /// Fraction of sequential steps that marks a bulk download.
    pub pattern_sequential_fraction: f64,
    /// Gap between consecutive range starts still counted as sequential.
    pub pattern_gap_bytes: u64,
    /// Window count that must also be exceeded before a pattern denial.
    pub pattern_min_window_count: u32,
    /// Fraction of the asset a single range may cover.
    pub oversize_fraction: f64,
    /// Seconds of silence before a ledger entry is swept.
    pub ledger_idle_secs: i64,
    /// Hard ledger lifetime in seconds.
    pub ledger_max_age_secs: i64,
    /// Range samples retained per ledger.
    pub ledger_history_cap: usize,

    /// Keys issued per DRM key session.
    pub keys_per_session: usize,
    /// Seconds between per-key rotations.
    pub key_rotation_secs: i64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            token_ttl_secs: 30,
            session_ttl_secs: DEFAULT_SESSION_TTL,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT,
            sweep_grace_secs: 30,
            sweep_interval_secs: 60,
            max_concurrent_streams: 2,
            max_auth_failures: 5,
            window_secs: 60,
            window_max_requests: 50,
            pattern_min_history: 20,
            pattern_sample: 30,
            pattern_sequential_fraction: 0.9,
            pattern_gap_bytes: 10 * 1024 * 1024,
            pattern_min_window_count: 30,
            oversize_fraction: 0.2,
            ledger_idle_secs: 300,
            ledger_max_age_secs: 24 * 60 * 60,
            ledger_history_cap: 64,
            keys_per_session: 5,
            key_rotation_secs: 15 * 60,
        }
    }
}

impl ProtocolConfig {
    /// Build a config from `STREAMLOCK_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = ProtocolConfig::default();
        ProtocolConfig {
            chunk_size: env_u64("STREAMLOCK_CHUNK_SIZE", d.chunk_size),
            token_ttl_secs: env_i64("STREAMLOCK_TOKEN_TTL_SECS", d.token_ttl_secs),
            session_ttl_secs: env_i64("STREAMLOCK_SESSION_TTL_SECS", d.session_ttl_secs),
            inactivity_timeout_secs: env_i64(
                "STREAMLOCK_INACTIVITY_TIMEOUT_SECS",
                d.inactivity_timeout_secs,
            ),
            sweep_grace_secs: env_i64("STREAMLOCK_SWEEP_GRACE_SECS", d.sweep_grace_secs),
            sweep_interval_secs: env_u64("STREAMLOCK_SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            max_concurrent_streams: env_usize(
                "STREAMLOCK_MAX_CONCURRENT_STREAMS",
                d.max_concurrent_streams,
            ),
            max_auth_failures: env_u32("STREAMLOCK_MAX_AUTH_FAILURES", d.max_auth_failures),
            window_secs: env_i64("STREAMLOCK_WINDOW_SECS", d.window_secs),
            window_max_requests: env_u32("STREAMLOCK_WINDOW_MAX_REQUESTS", d.window_max_requests),
            pattern_min_history: env_usize("STREAMLOCK_PATTERN_MIN_HISTORY", d.pattern_min_history),
            pattern_sample: env_usize("STREAMLOCK_PATTERN_SAMPLE", d.pattern_sample),
            pattern_sequential_fraction: env_f64(
                "STREAMLOCK_PATTERN_SEQUENTIAL_FRACTION",
                d.pattern_sequential_fraction,
            ),
            pattern_gap_bytes: env_u64("STREAMLOCK_PATTERN_GAP_BYTES", d.pattern_gap_bytes),
            pattern_min_window_count: env_u32(
                "STREAMLOCK_PATTERN_MIN_WINDOW_COUNT",
                d.pattern_min_window_count,
            ),
            oversize_fraction: env_f64("STREAMLOCK_OVERSIZE_FRACTION", d.oversize_fraction),
            ledger_idle_secs: env_i64("STREAMLOCK_LEDGER_IDLE_SECS", d.ledger_idle_secs),
            ledger_max_age_secs: env_i64("STREAMLOCK_LEDGER_MAX_AGE_SECS", d.ledger_max_age_secs),
            ledger_history_cap: env_usize("STREAMLOCK_LEDGER_HISTORY_CAP", d.ledger_history_cap),
            keys_per_session: env_usize("STREAMLOCK_KEYS_PER_SESSION", d.keys_per_session),
            key_rotation_secs: env_i64("STREAMLOCK_KEY_ROTATION_SECS", d.key_rotation_secs),
        }
    }

    /// Largest range a single request may cover for the given asset size.
    pub fn oversize_limit(&self, asset_size: u64) -> u64 {
        (asset_size as f64 * self.oversize_fraction) as u64
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
