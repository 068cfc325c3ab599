use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use tokio::net::TcpListener;

use streamlock::modules::origin::{HttpOriginStore, MemoryOriginStore, OriginStore};
use streamlock::modules::stream_api::{stream_routes, StreamApiState};
use streamlock::protocol::clock::SystemClock;
use streamlock::protocol::config::ProtocolConfig;
use streamlock::protocol::delivery::ChunkDeliveryService;
use streamlock::protocol::sweeper::ExpirySweeper;
use streamlock::protocol::token::TokenAuthority;

/// Demo video id served when no origin is configured.
const DEMO_VIDEO_ID: &str = "demo";

/// Demo asset size (8 MiB, nine chunks at the default chunk size).
const DEMO_ASSET_SIZE: usize = 8 * 1024 * 1024 + 512 * 1024;

#[derive(Debug, Clone)]
struct ServerSettings {
    port: u16,
    token_secret: Option<Vec<u8>>,
    origin_url: Option<String>,
}

fn load_config() -> Result<ServerSettings, Box<dyn std::error::Error>> {
    let token_secret = match env::var("STREAMLOCK_TOKEN_SECRET") {
        Ok(hex_secret) => Some(hex::decode(hex_secret)?),
        Err(_) => None,
    };
    Ok(ServerSettings {
        port: env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()?,
        token_secret,
        origin_url: env::var("STREAMLOCK_ORIGIN_URL").ok(),
    })
}

/// Deterministic patterned bytes standing in for real media.
fn demo_asset() -> Bytes {
    let mut data = Vec::with_capacity(DEMO_ASSET_SIZE);
    for i in 0..DEMO_ASSET_SIZE {
        data.push((i % 251) as u8);
    }
    Bytes::from(data)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = load_config()?;
    let config = ProtocolConfig::from_env();

    // Token signing secret: configured, or fresh for this process; a fresh
    // secret invalidates outstanding tokens across restarts
    let secret = match settings.token_secret {
        Some(secret) => secret,
        None => {
            warn!("STREAMLOCK_TOKEN_SECRET not set; tokens will not survive a restart");
            TokenAuthority::random_secret().to_vec()
        }
    };

    // Origin: a remote HTTP object host, or the built-in demo asset
    let origin: Arc<dyn OriginStore> = match &settings.origin_url {
        Some(url) => {
            info!("Serving from HTTP origin {}", url);
            Arc::new(HttpOriginStore::new(url.clone()))
        }
        None => {
            let store = MemoryOriginStore::new();
            store.insert(DEMO_VIDEO_ID, demo_asset(), "video/mp4").await;
            info!(
                "No STREAMLOCK_ORIGIN_URL set; serving the built-in demo video \"{}\"",
                DEMO_VIDEO_ID
            );
            Arc::new(store)
        }
    };

    // Delivery pipeline and background sweeper
    let clock = Arc::new(SystemClock);
    let delivery = ChunkDeliveryService::new(config.clone(), clock.clone(), origin, &secret);
    let sweeper = ExpirySweeper::new(
        delivery.sessions().clone(),
        delivery.keys().clone(),
        delivery.abuse().clone(),
        clock,
        config.sweep_grace_secs,
        delivery.metrics(),
    )
    .start(Duration::from_secs(config.sweep_interval_secs));

    // HTTP surface
    let state = Arc::new(StreamApiState { delivery });
    let app = stream_routes(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    // Stop the sweeper once the listener has drained
    sweeper.shutdown().await;
    info!("Server stopped");
    Ok(())
}
