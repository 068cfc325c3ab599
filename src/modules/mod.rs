pub mod chunk_crypto;
pub mod metrics;
pub mod origin;
pub mod stream_api;
