//! # Pharmacy Voice Backend - Main Application Entry Point
//!
//! Actix-web server hosting a voice agent for pharmacy order questions.
//! Browsers connect over WebSocket, stream microphone PCM, and get back
//! transcripts, status updates, and synthesized reply audio. A small HTTP
//! surface exposes health, metrics, and runtime configuration.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared state, pharmacy snapshot, metrics counters
//! - **audio**: PCM validation and the base64 audio envelope
//! - **pharmacy**: identifier normalization, data store, tool dispatcher
//! - **agent**: upstream STT/LLM/TTS clients and the conversation session
//! - **websocket**: the per-connection voice actor
//! - **health / handlers / middleware**: the HTTP surface

mod agent;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pharmacy;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use pharmacy::PharmacyStore;
use state::AppState;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, error, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task; polled by the main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting pharmacy-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    if config.agent.openai_api_key.is_empty() || config.agent.deepgram_api_key.is_empty() {
        warn!("OPENAI_API_KEY or DEEPGRAM_API_KEY not set; voice connections will be refused");
    }

    let store = load_store(&config)?;
    info!(
        members = store.member_count(),
        orders = store.order_count(),
        "Pharmacy dataset loaded"
    );

    let app_state = AppState::new(config.clone(), store);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The browser client is served from a different origin in development
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Load the pharmacy dataset from the configured file, or fall back to the
/// snapshot bundled into the binary.
fn load_store(config: &AppConfig) -> Result<PharmacyStore> {
    match &config.data.file {
        Some(path) => PharmacyStore::load(Path::new(path))
            .with_context(|| format!("Failed to load pharmacy data from {}", path)),
        None => PharmacyStore::bundled().context("Bundled pharmacy data is invalid"),
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pharmacy_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// SIGTERM/SIGINT both request a graceful stop.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
