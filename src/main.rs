#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # acp-sessiond
//!
//! Session server mediating browser/CLI clients and ACP agent subprocesses.
//!
//! Exposes a REST API for session/workspace/queue management plus two
//! WebSocket endpoints: a per-session stream (`/api/sessions/{id}/ws`) and a
//! global lifecycle-event channel (`/api/events`).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use acp_sessiond::{
    config::Config,
    routes,
    sessions::{store::EventStore, SessionManager},
    state::AppState,
    ws,
};

/// Session server mediating browser/CLI clients and ACP agent subprocesses.
#[derive(Parser)]
#[command(name = "acp-sessiond", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    run_server(cli.config.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("acp-sessiond v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {}", config.server.data_dir);
    info!("Listening on {}", config.server.listen);

    let config = Arc::new(config);
    let store = EventStore::new(config.server.data_dir.clone());
    let session_manager = SessionManager::new(store, config.clone());
    session_manager.reconcile_on_startup().await;

    let (session_events, _) = broadcast::channel(256);

    let state = AppState {
        config: config.clone(),
        start_time: Instant::now(),
        session_manager,
        session_events,
    };

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route(
            "/api/sessions",
            post(routes::sessions::create_session).get(routes::sessions::list_sessions),
        )
        .route(
            "/api/sessions/{id}",
            get(routes::sessions::get_session)
                .patch(routes::sessions::rename_session)
                .delete(routes::sessions::delete_session),
        )
        .route("/api/sessions/{id}/cancel", post(routes::sessions::cancel_session))
        .route(
            "/api/sessions/{id}/queue",
            get(routes::queue::list_queue).post(routes::queue::push_queue),
        )
        .route(
            "/api/sessions/{id}/queue/{queue_id}",
            delete(routes::queue::remove_queue_item),
        )
        .route(
            "/api/workspaces",
            post(routes::workspaces::register_workspace).get(routes::workspaces::list_workspaces),
        )
        .route("/api/workspaces/{working_dir}", delete(routes::workspaces::remove_workspace))
        .route("/api/sessions/{id}/ws", get(ws::session_ws_upgrade))
        .route("/api/events", get(ws::global::global_ws_upgrade));

    // GUARD: Headers must be listed explicitly — `allow_headers(Any)` works in
    // Chrome but Firefox rejects credentialed requests without explicit listing.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    // GUARD: .layer() only applies to routes merged BEFORE the call.
    let app = app
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: drop terminated sessions from the in-memory registry
    // and broadcast their departure to global-events subscribers.
    let mgr = state.session_manager.clone();
    let sweep_tx = state.session_events.clone();
    let sweep_interval_secs = state.config.server.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(sweep_interval_secs));
        loop {
            interval.tick().await;
            let removed = mgr.sweep().await;
            for session_id in removed {
                let _ = sweep_tx.send(serde_json::json!({
                    "type": "session.destroyed",
                    "session_id": session_id,
                    "reason": "terminated",
                }));
            }
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    state.session_manager.kill_all().await;
    info!("Goodbye");
}
