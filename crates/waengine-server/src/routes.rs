use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use libwaengine::{ConnectOutcome, EngineError, ErrorKind, SessionManager};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};
use waengine_protocol::{
    ApiReply, ConnectRequest, ConnectResponse, ConnectStatus, SendMessageRequest, ViewerEvent,
    validate_instance_id,
};

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
}

pub fn router(manager: Arc<SessionManager>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/send-message", post(send_message))
        .route("/instances", get(list_instances))
        .route("/instances/{id}", get(instance_info))
        .route("/ws/instances/{id}", get(ws_instance))
        .layer(cors)
        .with_state(AppState { manager })
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return Ok(cors.allow_origin(Any));
    }

    let headers = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(cors.allow_origin(AllowOrigin::list(headers)))
}

fn reply(status: StatusCode, body: ApiReply) -> Response {
    (status, Json(body)).into_response()
}

fn invalid(message: impl Into<String>) -> Response {
    reply(
        StatusCode::UNPROCESSABLE_ENTITY,
        ApiReply::Error {
            message: message.into(),
        },
    )
}

fn engine_error(err: EngineError) -> Response {
    let (kind, message) = err.to_error_kind();
    let status = match kind {
        ErrorKind::Invalid => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotConnected => StatusCode::BAD_REQUEST,
        ErrorKind::Upstream | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    reply(status, ApiReply::Error { message })
}

async fn connect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return invalid(rejection.body_text()),
    };
    let Some(instance_id) = req.instance_id else {
        return invalid("instance_id is required");
    };

    match state.manager.connect(&instance_id).await {
        Ok(outcome) => {
            let status = match outcome {
                ConnectOutcome::AlreadyConnected => ConnectStatus::AlreadyConnected,
                ConnectOutcome::Started | ConnectOutcome::AlreadyInitializing => {
                    ConnectStatus::Initializing
                }
            };
            Json(ConnectResponse { status }).into_response()
        }
        Err(err) => engine_error(err),
    }
}

async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return invalid(rejection.body_text()),
    };
    let (Some(instance_id), Some(number), Some(message)) =
        (req.instance_id, req.number, req.message)
    else {
        return invalid("instance_id, number and message are required");
    };

    match state
        .manager
        .send_message(&instance_id, &number, &message)
        .await
    {
        Ok(()) => reply(
            StatusCode::OK,
            ApiReply::Success {
                message: "Message sent".to_string(),
            },
        ),
        Err(err) => engine_error(err),
    }
}

async fn list_instances(State(state): State<AppState>) -> Response {
    Json(state.manager.list()).into_response()
}

async fn instance_info(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.snapshot(&id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => reply(
            StatusCode::NOT_FOUND,
            ApiReply::Error {
                message: format!("unknown instance {id}"),
            },
        ),
    }
}

async fn ws_instance(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(reason) = validate_instance_id(&id) {
        return invalid(reason);
    }
    // Subscribe before the upgrade completes so nothing published after the
    // handshake is missed.
    let events = state.manager.subscribe(&id);
    ws.on_upgrade(move |socket| viewer_task(socket, id, events))
}

async fn viewer_task(
    socket: WebSocket,
    instance_id: String,
    mut events: broadcast::Receiver<ViewerEvent>,
) {
    debug!(%instance_id, "viewer attached");
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%instance_id, skipped, "viewer fell behind, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%instance_id, error = %e, "failed to encode viewer event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Viewers only listen; pings are answered by axum.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(%instance_id, "viewer detached");
}
