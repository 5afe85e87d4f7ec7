//! # Emotion Stream Backend - Main Application Entry Point
//!
//! Real-time speech emotion recognition over WebSocket. Browsers stream
//! microphone audio to `/ws`; the server keeps a rolling window per connection,
//! skips silence, and classifies the rest with a Wav2Vec2 model.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared state: config, metrics, classifier, session registry
//! - **audio**: Window buffer, inference gate, session coordinator, decoding
//! - **classifier**: Classifier capability and its model backends
//! - **websocket**: One actor per streaming connection
//! - **handlers / health**: HTTP API
//! - **middleware**: Per-endpoint metrics
//! - **error**: Error types and HTTP error responses

mod audio;
mod classifier;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    // Validated inside load()
    let config = AppConfig::load()?;

    info!("Starting emotion-stream-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        backend = config.models.backend.as_str(),
        model = %config.models.emotion_model,
        window_seconds = config.audio.window_seconds,
        sample_rate = config.audio.sample_rate,
        "Emotion pipeline configured"
    );

    // The classifier is not loaded here; the first window that needs it pays the cost
    let app_state = web::Data::new(AppState::new(config.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware runs in reverse registration order for requests
        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(middleware::EndpointMetrics)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::emotion_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/classifier/status", web::get().to(handlers::classifier_status))
                    .route("/classifier/self-test", web::post().to(handlers::classifier_self_test))
                    .route("/classify/file", web::post().to(handlers::classify_file)),
            )
            .route("/health", web::get().to(health::health_check))
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

/// Console logging, filtered by `RUST_LOG`.
///
/// Defaults to `emotion_stream_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emotion_stream_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
///
/// If the handlers cannot be installed the server keeps running and can only be
/// stopped by killing the process.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

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
