//! HTTP surface: `POST /chat`, `POST /confirm-action` and `GET /health`.

#[cfg(test)]
mod tests;

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::ACCEPT_LANGUAGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use survey_agent_core::gate::{ConfirmationGate, GateError};
use survey_agent_core::{ChatRequest, ChatService, Locale, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenAuth;

const EVENT_BUFFER: usize = 32;

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub gate: Arc<ConfirmationGate>,
    pub auth: TokenAuth,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/confirm-action", post(confirm_action))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    locale: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody {
    action_id: String,
    confirmed: bool,
    #[serde(default)]
    locale: Option<String>,
}

fn locale(hint: Option<&str>, headers: &HeaderMap) -> Locale {
    let header = headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next());
    Locale::from_hint(hint.or(header))
}

fn frame(event: &StreamEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data(r#"{"type":"error"}"#))
}

/// A stream holding a single `error` frame.
fn error_stream(status: StatusCode, message: &str) -> Response {
    let event = frame(&StreamEvent::error(message));
    let stream = tokio_stream::once(Ok::<_, Infallible>(event));
    (status, Sse::new(stream)).into_response()
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Response {
    let Some(user_id) = state.auth.user_id(&headers).map(ToOwned::to_owned)
    else {
        return error_stream(StatusCode::UNAUTHORIZED, "unauthorized");
    };
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return error_stream(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };
    if body.message.trim().is_empty() {
        return error_stream(StatusCode::BAD_REQUEST, "message is empty");
    }

    let req = ChatRequest {
        user_id,
        message: body.message,
        session_id: body.session_id,
        locale: locale(body.locale.as_deref(), &headers),
    };
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    // Dropping the response body cancels the turn.
    let guard = cancel.clone().drop_guard();

    let chat = Arc::clone(&state.chat);
    tokio::spawn(async move {
        chat.handle(req, events_tx, cancel).await;
    });

    let stream = ReceiverStream::new(events_rx).map(move |event| {
        let _guard = &guard;
        Ok::<_, Infallible>(frame(&event))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Failures of `/confirm-action`, rendered as `{ "error": ... }`.
#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    Gate(GateError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized".to_owned())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Gate(err) => {
                let code = match &err {
                    GateError::NotFound => StatusCode::NOT_FOUND,
                    GateError::Conflict { .. } => StatusCode::CONFLICT,
                    GateError::UnsupportedTool(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    GateError::Execution(_) | GateError::Store(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let msg = match err {
                    GateError::Store(err) => {
                        error!("confirm-action failed: {err}");
                        "internal error".to_owned()
                    }
                    err => err.to_string(),
                };
                (code, msg)
            }
        };
        (code, Json(json!({ "error": msg }))).into_response()
    }
}

async fn confirm_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ConfirmBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state
        .auth
        .user_id(&headers)
        .ok_or(ApiError::Unauthorized)?;
    let Json(body) =
        body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let locale = locale(body.locale.as_deref(), &headers);
    let message = state
        .gate
        .resolve(&body.action_id, user_id, body.confirmed, locale)
        .await
        .map_err(ApiError::Gate)?;
    Ok(Json(json!({ "message": message })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
