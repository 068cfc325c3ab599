//! Secure chunked delivery protocol.
//!
//! Video is served as small, individually authorized chunks. Each chunk
//! request must present a fresh single-use token bound to one position in
//! the stream, and each response carries the credentials for the next
//! chunk, so a client can only walk the stream in order at roughly playback
//! pace.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────────┐     ┌─────────────┐
//! │  stream_api  │────▶│ ChunkDeliveryService │────▶│ OriginStore │
//! │ (axum layer) │     │    (orchestrator)    │     │   (trait)   │
//! └──────────────┘     └──────────┬───────────┘     └─────────────┘
//!                                 │
//!            ┌──────────────┬─────┴────────┬──────────────┐
//!            ▼              ▼              ▼              ▼
//!     ┌────────────┐ ┌──────────────┐ ┌──────────┐ ┌────────────┐
//!     │SessionStore│ │TokenAuthority│ │KeyManager│ │AbuseDetector│
//!     │   (CAS)    │ │  (HS256 JWT) │ │ (rotate) │ │  (ledgers) │
//!     └────────────┘ └──────────────┘ └──────────┘ └────────────┘
//! ```
//!
//! An [`ExpirySweeper`] task periodically rotates keys and removes expired
//! sessions, key sets, and idle ledgers. All timing flows through the
//! [`Clock`] trait so tests can drive expiry deterministically.
//!
//! # Usage
//!
//! ```ignore
//! use streamlock::protocol::{ChunkDeliveryService, MetadataRequest, ProtocolConfig, SystemClock};
//!
//! let service = ChunkDeliveryService::new(
//!     ProtocolConfig::from_env(),
//!     Arc::new(SystemClock),
//!     origin,
//!     &secret,
//! );
//!
//! let grant = service.issue_metadata(MetadataRequest { /* ... */ }).await?;
//! // walk chunks 0..total_chunks, presenting each response's next_token
//! ```

pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod session;
pub mod sweeper;
pub mod token;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProtocolConfig;
pub use delivery::{
    ChunkDelivery, ChunkDeliveryService, ChunkPayload, ChunkRequest, MetadataGrant,
    MetadataRequest, RangeDelivery, RangeRequest,
};
pub use error::DeliveryError;
pub use keys::{DrmKey, KeyManager, KeySet};
pub use ledger::AbuseDetector;
pub use session::{SessionStatus, SessionStore, StreamingSession};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
pub use token::{chain_link, ChunkClaims, IssuedToken, TokenAuthority};
