//! HTTP/WebSocket surface.
//!
//! One WebSocket connection owns one verification session; its frames are
//! processed strictly in arrival order. There is no internal frame queue — a
//! caller outrunning the pipeline must apply its own backpressure.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use veriface_core::{encode, quality, ControlMessage, FrameResponse, SessionConfig, VerificationSession};
use veriface_models::ModelRegistry;

#[derive(Clone)]
pub struct AppState {
    /// `None` when model loading failed at startup: the service stays up
    /// and reports itself unavailable instead of crashing.
    pub registry: Option<Arc<ModelRegistry>>,
    pub session_config: SessionConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/capture", post(capture))
        .route("/ws/verify", get(ws_verify))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models_loaded": state.registry.is_some(),
    }))
}

#[derive(Serialize)]
struct CaptureResponse {
    ready: bool,
    feedback: Vec<String>,
    coverage: f32,
    brightness: f32,
    sharpness: f32,
    #[serde(rename = "cardImage")]
    card_image: String,
}

/// One-shot capture: stateless quality assessment of a single upload.
async fn capture(State(state): State<AppState>, body: Bytes) -> Response {
    if state.registry.is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "models unavailable").into_response();
    }
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty upload").into_response();
    }
    let Ok(decoded) = image::load_from_memory(&body) else {
        return (StatusCode::BAD_REQUEST, "undecodable image").into_response();
    };
    let frame = decoded.to_rgb8();
    let jpeg_quality = state.session_config.jpeg_quality;

    let assessed = tokio::task::spawn_blocking(move || {
        quality::assess(&frame).map(|capture| {
            let card_image = encode::jpeg_base64(&capture.warped, jpeg_quality)?;
            Ok::<_, image::ImageError>(CaptureResponse {
                ready: capture.quad.ready,
                feedback: capture.quad.feedback,
                coverage: capture.quad.coverage,
                brightness: capture.quad.brightness,
                sharpness: capture.quad.sharpness,
                card_image,
            })
        })
    })
    .await;

    match assessed {
        Ok(Some(Ok(response))) => Json(response).into_response(),
        Ok(Some(Err(err))) => {
            tracing::error!(error = %err, "capture encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
        }
        Ok(None) => (StatusCode::UNPROCESSABLE_ENTITY, "no card detected").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "capture task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "assessment failed").into_response()
        }
    }
}

async fn ws_verify(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection loop: binary messages are frames, text messages are
/// control messages. One JSON response per processed frame.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut session = state
        .registry
        .as_ref()
        .map(|registry| {
            VerificationSession::new(state.session_config.clone(), registry.collaborators())
        });
    match &session {
        Some(session) => tracing::info!(session = %session.id(), "verification stream opened"),
        None => tracing::warn!("verification stream opened without models"),
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(bytes) => {
                let Ok(decoded) = image::load_from_memory(&bytes) else {
                    // undecodable frames are skipped silently: no response,
                    // no state mutation
                    continue;
                };
                let frame = decoded.to_rgb8();
                let response = match session.as_mut() {
                    Some(session) => {
                        match tokio::task::block_in_place(|| {
                            session.process_frame(&frame, Instant::now())
                        }) {
                            Ok(response) => response,
                            Err(err) => {
                                tracing::warn!(
                                    session = %session.id(),
                                    error = %err,
                                    "frame processing failed"
                                );
                                FrameResponse::unavailable(frame.width(), frame.height())
                            }
                        }
                    }
                    None => FrameResponse::unavailable(frame.width(), frame.height()),
                };
                let Ok(payload) = serde_json::to_string(&response) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => match ControlMessage::parse(&text) {
                Some(control) => {
                    if let Some(session) = session.as_mut() {
                        session.handle_control(control, Instant::now());
                    }
                }
                None => tracing::debug!(text = %text.trim(), "ignoring unknown control message"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some(session) = &session {
        tracing::info!(session = %session.id(), "verification stream closed");
    }
    // dropping the session releases all cached crops and embeddings
}
