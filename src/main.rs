//! Showroom Sync Backend
//!
//! Realtime inventory synchronization hub: a broadcast hub over WebSocket and
//! HTTP backed by a durable, single-writer JSON document store.

mod api;
mod auth;
mod config;
mod errors;
mod hub;
mod models;
mod store;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use hub::Hub;
use store::Store;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Showroom Sync Backend");
    tracing::info!("Store path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);
    tracing::info!(
        "Auth required: {}, allowed origins: {:?}",
        config.require_auth,
        config.allowed_origins
    );

    if config.require_auth && config.auth_secret.is_none() {
        tracing::warn!(
            "SHOWROOM_REQUIRE_AUTH is set without SHOWROOM_AUTH_SECRET; \
             handshakes degrade to a presence check"
        );
    }

    let config = Arc::new(config);

    // Open the store and prime the hub's mirror from disk
    let store = Store::new(&config.db_path);
    let hub = Arc::new(Hub::open(Arc::clone(&config), store).await);

    let state = AppState {
        hub,
        config: Arc::clone(&config),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Create the application router with all routes.
///
/// Every route is reachable both bare and under the `/api` prefix, matching
/// the storefront's endpoint discovery.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    let routes = Router::new()
        .route(
            "/inventory",
            get(api::get_inventory)
                .post(api::post_inventory)
                .delete(api::delete_inventory),
        )
        .route(
            "/promo",
            get(api::get_promos)
                .post(api::post_promo)
                .delete(api::delete_promo),
        )
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .route("/ws", get(hub::ws_handler));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS configuration: echo the origin only when it is in the allow-list, or
/// wildcard when no list is configured. Preflight requests are answered by
/// the layer with an empty body.
fn cors_layer(config: &Config) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, closing");
}

#[cfg(test)]
mod tests;
