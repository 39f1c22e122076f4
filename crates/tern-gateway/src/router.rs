use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::chat;
use crate::state::SharedState;

/// The API routes without middleware. Exposed separately so tests can
/// exercise handlers without per-IP state.
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/chat", post(chat::chat))
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            put(api::rename_conversation).delete(api::delete_conversation),
        )
        .route("/api/conversations/{id}/messages", get(api::list_messages))
        .route(
            "/api/conversations/{id}/messages/{message_id}/edit",
            post(api::edit_message),
        )
        .route("/api/settings", get(api::get_settings).put(api::put_settings))
        .route(
            "/api/memory",
            get(api::list_memory)
                .post(api::add_memory)
                .delete(api::clear_memory),
        )
        .route("/api/memory/{id}", delete(api::delete_memory))
        .route(
            "/api/tool-servers",
            get(api::list_tool_servers).post(api::add_tool_server),
        )
        .route(
            "/api/tool-servers/{id}",
            put(api::update_tool_server).delete(api::delete_tool_server),
        )
        .with_state(state)
}

/// Build the full application router with rate limiting, tracing and CORS.
pub fn build_router(state: SharedState) -> Router {
    // Per-IP rate limit from config.
    let rl = &state.config.gateway.rate_limit;
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(rl.per_second)
        .burst_size(rl.burst_size)
        .finish()
        .expect("governor config should be valid");
    let governor_limiter = governor_conf.limiter().clone();
    let governor_layer = GovernorLayer::new(governor_conf);

    // Clean up rate-limiter state for inactive IPs in the background.
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(60);
        loop {
            tokio::time::sleep(interval).await;
            governor_limiter.retain_recent();
        }
    });

    api_router(state)
        .layer(governor_layer)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
