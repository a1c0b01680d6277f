//! ==============================================================================
//! main.rs - telemetry relay entry point
//! ==============================================================================
//!
//! purpose:
//!     the process that sits between the field receiver and the outside world.
//!     the esp32 lora receiver posts measurement batches here; every reading
//!     is stored and relayed to sensor.community.
//!
//! responsibilities:
//!     - load relay.toml (or defaults)
//!     - initialise tracing
//!     - build the profile registry, store, http client and forwarder once
//!     - serve the ingest api until ctrl-c
//!
//! architecture:
//!
//!     ┌──────────────┐  POST /espdata   ┌──────────────────────────────────┐
//!     │ esp32 lora   │ ───────────────► │ relay (this process)             │
//!     │ receiver     │                  │  api ─► pipeline ─► normalizer   │
//!     └──────────────┘                  │              │                   │
//!                                       │              ├─► store (pg/mem)  │
//!                                       │              └─► forwarder ──────┼──► sensor.community
//!                                       └──────────────────────────────────┘
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use telemetry_relay::config::{RelayConfig, StorageBackend};
use telemetry_relay::forward::{DisabledForwarder, Forwarder, HttpForwarder};
use telemetry_relay::store::{MemoryStore, PgStore, ReadingStore};
use telemetry_relay::{build_router, AppState, Normalizer, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration (before logging so the level can come from it)
    let (config, config_path) = RelayConfig::load_or_default()?;

    // step 2: logging
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("===========================================================");
    tracing::info!("  Telemetry Relay {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("===========================================================");
    match &config_path {
        Some(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
        None => tracing::warn!("[CONFIG] No config file found - using defaults"),
    }
    config.print_summary();

    // step 3: profile table, shared read-only by every component
    let registry = Arc::new(config.build_registry()?);

    // step 4: storage
    let store: Arc<dyn ReadingStore> = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!(
                "[STARTUP] Memory storage keeps the last {} readings only",
                config.storage.memory_capacity
            );
            Arc::new(MemoryStore::with_capacity(config.storage.memory_capacity))
        }
        StorageBackend::Postgres => {
            let url = config
                .storage
                .url
                .as_deref()
                .context("[storage] url is required for the postgres backend")?;
            let store = PgStore::connect(url, config.storage.max_connections, registry.clone())
                .await
                .context("failed to connect to postgres")?;
            Arc::new(store)
        }
    };
    tracing::info!("[STARTUP] ✓ Storage ready ({})", store.backend());

    // step 5: forwarder, with the one http client the process uses
    let forwarder: Arc<dyn Forwarder> = if config.forwarding.enabled {
        let client = reqwest::Client::builder()
            .timeout(config.forward_timeout())
            .user_agent(config.forwarding.software_version.clone())
            .build()
            .context("failed to build http client")?;
        Arc::new(HttpForwarder::new(client, registry.clone(), config.protocol_variant()))
    } else {
        tracing::warn!("[STARTUP] Forwarding disabled - readings are stored only");
        Arc::new(DisabledForwarder)
    };

    // step 6: pipeline + api
    let normalizer = Normalizer::new(registry, config.ingest.sensor_id_mode);
    let pipeline = Arc::new(Pipeline::new(normalizer, store, forwarder));
    let state = AppState {
        pipeline,
        log_payloads: config.logging.log_payloads,
    };
    let app = build_router(state);

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("[STARTUP] ✓ Relay listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("[SHUTDOWN] Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
