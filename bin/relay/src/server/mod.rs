//! HTTP surface of `relay serve`: REST endpoints for the phone client plus
//! the agent and user WebSocket endpoints.

pub mod api;
pub mod ws;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use relay_agent::ChatRuntime;
use relay_core::Config;
use relay_hub::Hub;
use relay_storage::Store;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub store: Store,
    pub runtime: Arc<ChatRuntime>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);
    let web_dir = state.config.server.web_dir.clone();

    let mut app = Router::new()
        .route("/api/login", post(api::handle_login))
        .route("/api/logout", post(api::handle_logout))
        .route("/api/check-auth", get(api::handle_check_auth))
        .route("/api/pair", post(api::handle_pair))
        .route(
            "/api/agents",
            get(api::handle_agents_list).delete(api::handle_agents_delete),
        )
        .route("/ws/agent", get(ws::handle_agent_upgrade))
        .route("/ws/user", get(ws::handle_user_upgrade));

    if let Some(dir) = web_dir.filter(|d| !d.is_empty()) {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the configured origins; without any, a permissive
/// layer without credentials.
fn build_cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        return CorsLayer::permissive().allow_credentials(false);
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}
