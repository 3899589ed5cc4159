use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{RawQuery, State, WebSocketUpgrade},
        response::IntoResponse,
        routing::{delete, get, post},
    },
    pollcast_config::PollcastConfig,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{
    api::{self, ApiError},
    services,
    state::AppState,
    ws::{handle_connection, requested_channels},
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/api/polls/{id}", get(api::get_poll_handler))
        .route("/api/polls/{id}/launch", post(api::launch_poll_handler))
        .route("/api/polls/{id}/cancel", post(api::cancel_poll_handler))
        .route(
            "/api/campaigns/{campaign_id}/streamers/{streamer_id}",
            delete(api::remove_streamer_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the gateway HTTP + WebSocket server and run until Ctrl-C.
pub async fn start_gateway(config: PollcastConfig) -> anyhow::Result<()> {
    let state = services::build_state(&config).await?;
    let controller = Arc::clone(&state.controller);
    let app = build_gateway_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down running polls");
    controller.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let channels = requested_channels(query.as_deref());
    if channels.is_empty() {
        return Err(ApiError::bad_request("at least one channel is required"));
    }
    let broadcaster = state.broadcaster;
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, broadcaster, channels)))
}
