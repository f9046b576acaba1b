use crate::config::{AppState, ServerConfig};
use crate::session::SessionGuard;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Start the HTTP server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("MCP server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(open_session))
        .route("/message", post(post_message))
        .route("/api/health", get(health_check))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "roster",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /sse` — open a session and stream protocol traffic to the client
///
/// The first event names the endpoint the client must post its messages to;
/// every following `message` event carries one JSON-RPC frame. Dropping the
/// stream (client disconnect) tears the session down.
async fn open_session(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection");

    let (session_id, mut frames) = state
        .sessions
        .open(state.capabilities.clone(), state.sampling_timeout);
    let guard = SessionGuard::new(session_id.clone(), state.sessions.clone());
    let endpoint = format!("/message?sessionId={}", session_id);

    let stream = async_stream::stream! {
        let _guard = guard;

        yield Ok(Event::default().event("endpoint").data(endpoint));

        while let Some(frame) = frames.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => yield Ok(Event::default().event("message").data(json)),
                Err(err) => tracing::error!("Failed to serialize outbound frame: {}", err),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `POST /message?sessionId=<id>` — deliver one client-to-server frame
///
/// Protocol replies travel back over the session's event stream; this
/// handler only acknowledges delivery.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MessageParams>,
    body: String,
) -> Response {
    let Some(connection) = state.sessions.get(&params.session_id) else {
        tracing::info!("Session not found: {}", params.session_id);
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    match connection.handle_message(&body).await {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(err) => {
            tracing::debug!("Rejected unparseable message: {}", err);
            (StatusCode::BAD_REQUEST, "Invalid message").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(temp_dir: &tempfile::TempDir) -> AppState {
        let config = ServerConfig::load(
            &temp_dir.path().join("missing.toml"),
            temp_dir.path().to_path_buf(),
        )
        .unwrap();
        AppState::new(&config).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let app = create_router(test_state(&temp_dir));

        let response = app
            .oneshot(
                Request::post("/message?sessionId=not-a-session")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Session not found");
    }

    #[tokio::test]
    async fn test_known_session_accepts_messages() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (session_id, mut frames) = state
            .sessions
            .open(state.capabilities.clone(), state.sampling_timeout);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::post(format!("/message?sessionId={}", session_id))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_text(response).await, "Accepted");

        // The reply arrives on the session stream, not the POST response
        let frame = frames.recv().await.expect("frame");
        let json = serde_json::to_value(&frame).unwrap();
        let tools = json["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "create-user"));
        assert!(tools.iter().any(|t| t["name"] == "create-random-user"));
    }

    #[tokio::test]
    async fn test_unparseable_message_is_400() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (session_id, _frames) = state
            .sessions
            .open(state.capabilities.clone(), state.sampling_timeout);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::post(format!("/message?sessionId={}", session_id))
                    .body(Body::from("definitely not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_check() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let app = create_router(test_state(&temp_dir));

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["service"], "roster");
    }
}
