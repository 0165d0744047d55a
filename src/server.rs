//! Subscribe endpoint: project-scoped WebSocket streams of run progress.
//!
//! A subscriber first receives the buffered frames of the run in flight,
//! then live frames as they are produced. Inbound `ping` frames are answered
//! on the error channel with `"pong"`; everything else from the client is
//! ignored.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::trace::StreamFrame;

pub fn build_router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws/{project_id}", get(ws_handler))
        .with_state(engine)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    State(engine): State<Engine>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine, project_id))
}

async fn handle_socket(mut socket: WebSocket, engine: Engine, project_id: String) {
    let (buffered, mut rx) = engine.bus().subscribe(&project_id);
    debug!(project = %project_id, backlog = buffered.len(), "subscriber connected");

    // Replay the run so far before anything live.
    for frame in &buffered {
        if send_frame(&mut socket, frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(project = %project_id, missed, "subscriber lagged");
                        continue;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = StreamFrame::Error { error: "pong".to_string() };
                            if send_frame(&mut socket, &pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(err) => {
            debug!(error = %err, "failed to serialize frame");
            Ok(())
        }
    }
}

/// A client ping is either the bare word or a `{"type":"ping"}` frame.
fn is_ping(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

/// Bind and serve until ctrl-c, then shut the engine down.
pub async fn start_server(engine: Engine) -> Result<()> {
    let server = &engine.config().server;
    let mut app = build_router(engine.clone());
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %listener.local_addr()?, "engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown().await;
    info!("engine shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
}
