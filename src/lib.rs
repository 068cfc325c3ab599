//! Secure chunked media delivery.
//!
//! Video is served as small, individually authorized chunks behind
//! rotating single-use tokens, a per-session hash chain, optional AES-GCM
//! payload encryption, and request-rate heuristics. See the
//! [`protocol`] module for the full picture.

// Core protocol: sessions, tokens, keys, abuse ledgers, delivery
pub mod protocol;

// Supporting modules: crypto, origin access, metrics, HTTP surface
pub mod modules;

// Re-export the embedding surface
pub use modules::origin::{HttpOriginStore, MemoryOriginStore, OriginObject, OriginStore};
pub use protocol::{ChunkDeliveryService, DeliveryError, ProtocolConfig};
