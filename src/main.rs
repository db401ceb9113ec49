//! # TalkCode Backend - Main Application Entry Point
//!
//! Sets up the Actix-web HTTP server for voice-driven coding practice
//! sessions.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state, metrics, and core singletons
//! - **limiter**: sliding-window admission control per client
//! - **scheduler**: debounce timers coalescing bursts of edits
//! - **analysis**: reasoning backend client and the local fallback analyzer
//! - **audio**: bounded spoken-feedback playback queue
//! - **session**: the per-session orchestration state machine
//! - **handlers** / **websocket**: the HTTP and WebSocket surfaces
//! - **middleware**: request logging and per-endpoint metrics

mod analysis;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod limiter;
mod middleware;
mod scheduler;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use analysis::HttpBackend;
use anyhow::Result;
use audio::SimulatedSink;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// How often idle state is swept: stale debounce timers, ended sessions,
/// and rate-limiter buckets nobody has touched lately.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting talkcode-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let backend = Arc::new(HttpBackend::from_config(&config.analysis));
    let app_state = AppState::new(config.clone(), backend, Arc::new(SimulatedSink));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_maintenance(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::EndpointMetrics)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/analyze", web::post().to(handlers::analyze))
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/ws/session", web::get().to(websocket::session_websocket))
            // Health check at root level for probes that can't be configured
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

/// Initialize structured logging. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkcode_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodic background sweep. Keeps long-running processes from
/// accumulating ended sessions, orphaned timers, and idle limiter buckets.
fn spawn_maintenance(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }

            let sweep_age = {
                let sweep_ms = state.get_config().analysis.sweep_max_age_ms;
                Duration::from_millis(sweep_ms)
            };
            let swept_timers = state.scheduler.sweep(sweep_age);
            let dropped_sessions = state.sessions.cleanup();
            let evicted_buckets = state.limiter.evict_idle();

            if swept_timers + dropped_sessions + evicted_buckets > 0 {
                debug!(
                    swept_timers,
                    dropped_sessions,
                    evicted_buckets,
                    "maintenance sweep"
                );
            }
        }
    });
}

/// Listen for SIGTERM and SIGINT; set the global shutdown flag on either.
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

/// Poll the shutdown flag. Simple and good enough for a single process.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
