//! Colorfall - game server with HTTP and WebSocket routes.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use protocol::ServerEvent;
use serde::Deserialize;
use serde_json::json;
use server::{GameRegistry, RegistryError, SessionError, SessionHandle, SubmitError};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    registry: GameRegistry,
    client_buffer: usize,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,server=debug")),
        )
        .init();

    info!("Colorfall Server v{}", env!("CARGO_PKG_VERSION"));

    let config = server::Config::load()?;
    info!("Loaded configuration");
    info!("  Port: {}", config.server.port);
    info!("  Map: {}x{}", config.game.map_width, config.game.map_height);
    info!("  Players: {}-{}", config.game.min_players, config.game.max_players);
    info!("  Max rounds: {}", config.game.max_rounds);

    let state = AppState {
        registry: GameRegistry::new(config.server.clone(), config.game.clone())?,
        client_buffer: config.server.client_buffer.max(1),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/game", post(create_game))
        .route("/api/game/{id}/state", get(game_state))
        .route("/api/game/{id}/ws", get(websocket_handler))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server running on http://{}", addr);
    info!("Create a game with POST http://{}/api/game", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn registry_error(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "games": state.registry.len().await }))
}

async fn create_game(State(state): State<AppState>) -> Response {
    match state.registry.create().await {
        Ok(handle) => (StatusCode::CREATED, Json(json!({ "game_id": handle.game_id() }))).into_response(),
        Err(e) => registry_error(e),
    }
}

async fn game_state(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.registry.snapshot(&id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => registry_error(e),
    }
}

/// Upgrade to a WebSocket and join the game as `name`.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> Response {
    let handle = match state.registry.get(&id).await {
        Ok(handle) => handle,
        Err(e) => return registry_error(e),
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, handle, params.name, state.client_buffer))
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match event.to_json() {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.kind(), e);
            None
        }
    }
}

/// Pump one player's socket: inbound frames to the session, session events to the socket.
async fn handle_websocket(socket: WebSocket, handle: SessionHandle, name: String, client_buffer: usize) {
    let (mut write, mut read) = socket.split();
    let (outbound, mut events) = mpsc::channel(client_buffer);

    let id = match handle.join(&name, outbound).await {
        Ok(id) => id,
        Err(e) => {
            let code = match &e {
                SessionError::Join(join) => join.code(),
                SessionError::Submit(SubmitError::Backpressure) => "BUSY",
                SessionError::Submit(SubmitError::SessionClosed) => "GAME_CLOSED",
            };
            info!("Join to game {} refused for {:?}: {}", handle.game_id(), name, e);
            let refusal = ServerEvent::Error {
                code: code.to_string(),
                message: e.to_string(),
            };
            if let Some(message) = encode(&refusal) {
                let _ = write.send(message).await;
            }
            let _ = write.send(Message::Close(None)).await;
            return;
        }
    };
    info!("{:?} connected to game {} as player {}", name, handle.game_id(), id);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match handle.submit_text(id, text.as_str()) {
                        Ok(()) => {}
                        Err(SubmitError::Backpressure) => {
                            debug!("Game {} busy, dropped frame from player {}", handle.game_id(), id);
                        }
                        Err(SubmitError::SessionClosed) => break,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error from player {}: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                // `None`: the session dropped us or shut down.
                let Some(event) = event else { break };
                let Some(message) = encode(&event) else { continue };
                if let Err(e) = write.send(message).await {
                    warn!("Failed to send {} to player {}: {}", event.kind(), id, e);
                    break;
                }
            }
        }
    }

    info!("Player {} disconnected from game {}", id, handle.game_id());
    let _ = handle.leave(id).await;
}
