use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::controller::ChatController;
use crate::models::{
    CreateChatRequest, Message, RelayRequest, RenameRequest, SaveMessagesRequest, SendRequest,
};
use crate::relay::{ChatBackend, RelayError};
use crate::store::{ConversationStore, StoreError};

/// Application state shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConversationStore>,
    pub backend: Arc<dyn ChatBackend>,
    pub config: Arc<ServerConfig>,
}

/// Create router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(relay_chat))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/:id",
            get(get_chat).post(rename_chat).delete(delete_chat),
        )
        .route(
            "/api/chats/:id/messages",
            get(get_messages).post(save_messages),
        )
        .route("/api/chats/:id/send", post(send_message))
        .with_state(state)
}

/// POST /api/chat - relay one streaming completion as plain text.
async fn relay_chat(State(state): State<AppState>, body: String) -> Result<Response, AppError> {
    // Reject malformed bodies before any upstream contact.
    let request: RelayRequest = serde_json::from_str(&body).map_err(AppError::InvalidRequest)?;

    let cancel = CancellationToken::new();
    let stream = state.backend.open(&request, cancel.clone()).await?;

    // Cancel the relay loop deterministically once the client goes away and
    // the response body is dropped.
    let guard = cancel.drop_guard();
    let body = Body::from_stream(stream.map(move |fragment| {
        let _ = &guard;
        Ok::<_, Infallible>(fragment)
    }));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .map_err(|e| AppError::Internal(e.into()))
}

/// GET /api/chats - index entries as `{id, name}`, most recent first.
async fn list_chats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let entries = state.store.list().await?;
    let items: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| serde_json::json!({ "id": e.id, "name": e.name }))
        .collect();
    Ok(Json(serde_json::Value::Array(items)))
}

/// POST /api/chats - create a conversation. A missing or malformed body means
/// the default name.
async fn create_chat(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: CreateChatRequest = serde_json::from_str(&body).unwrap_or_default();
    let conversation = state.store.create(request.name).await?;
    Ok(Json(serde_json::json!({
        "id": conversation.id,
        "name": conversation.name,
    })))
}

/// GET /api/chats/:id - full conversation or 404.
async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let conversation = state.store.get(id).await?;
    Ok(Json(serde_json::to_value(conversation)?))
}

/// POST /api/chats/:id - rename. A missing name is a successful no-op.
async fn rename_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: String,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: RenameRequest = serde_json::from_str(&body).unwrap_or_default();
    state.store.rename(id, request.name.as_deref()).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// DELETE /api/chats/:id - always succeeds from the caller's perspective.
async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.delete(id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/chats/:id/messages - message list, empty when the record is
/// missing.
async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, AppError> {
    Ok(Json(state.store.get_messages(id).await?))
}

/// POST /api/chats/:id/messages - wholesale overwrite of the stored list.
async fn save_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: String,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: SaveMessagesRequest = serde_json::from_str(&body).unwrap_or_default();
    state.store.save_messages(id, request.messages).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/chats/:id/send - run the full send cycle server-side and return
/// the finalized assistant turn.
async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: String,
) -> Result<Json<Message>, AppError> {
    let request: SendRequest = serde_json::from_str(&body).map_err(AppError::InvalidRequest)?;

    // The reply must land in an existing conversation, not an implicit one.
    state.store.get(id).await?;

    let mut controller = ChatController::new(
        state.store.clone(),
        state.backend.clone(),
        state.config.model.clone(),
        state.config.options,
    );
    controller.select(Some(id)).await?;

    match controller.send(&request.message, CancellationToken::new()).await {
        Some(reply) => Ok(Json(reply)),
        None => Err(AppError::BadRequest("message must not be empty".into())),
    }
}

/// Error handling.
#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
    NotFound(String),
    InvalidRequest(serde_json::Error),
    BadRequest(String),
    Backend(RelayError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::NotFound("Not found".into()),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        AppError::Backend(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidRequest(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": err.to_string() }),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            AppError::InvalidRequest(err) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "invalid request body", "detail": err.to_string() }),
            ),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            AppError::Backend(err) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "error": "failed to reach the inference backend",
                    "detail": err.to_string(),
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationOptions, DEFAULT_CONVERSATION_NAME};
    use crate::relay::FragmentStream;
    use async_trait::async_trait;
    use axum::http::Request;
    use futures::stream;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct ScriptedBackend {
        fragments: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn open(
            &self,
            _request: &RelayRequest,
            _cancel: CancellationToken,
        ) -> Result<FragmentStream, RelayError> {
            if self.fail {
                return Err(RelayError::Status {
                    status: 500,
                    detail: "backend down".into(),
                });
            }
            Ok(Box::pin(stream::iter(self.fragments.clone())))
        }
    }

    async fn create_test_app(fragments: &[&str], fail: bool) -> (TempDir, Router) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ConversationStore::open(temp_dir.path()).await.unwrap());
        let backend: Arc<dyn ChatBackend> = Arc::new(ScriptedBackend {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail,
        });
        let config = Arc::new(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            backend_url: "http://localhost:11434".into(),
            data_dir: temp_dir.path().to_path_buf(),
            model: "gpt-oss:20b".into(),
            options: GenerationOptions::default(),
            web_dir: None,
        });
        let app = create_router(AppState {
            store,
            backend,
            config,
        });
        (temp_dir, app)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn relay_streams_fragments_as_plain_text() {
        let (_tmp, app) = create_test_app(&["Hel", "lo"], false).await;

        let response = app
            .oneshot(post("/api/chat", r#"{"model":"m","messages":[]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(body_text(response).await, "Hello");
    }

    #[tokio::test]
    async fn relay_rejects_malformed_bodies_with_400() {
        let (_tmp, app) = create_test_app(&[], false).await;
        let response = app
            .oneshot(post("/api/chat", "this is not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid request body");
    }

    #[tokio::test]
    async fn relay_maps_backend_failure_to_502() {
        let (_tmp, app) = create_test_app(&[], true).await;
        let response = app
            .oneshot(post("/api/chat", r#"{"model":"m","messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("backend down"));
    }

    #[tokio::test]
    async fn chats_crud_flow() {
        let (_tmp, app) = create_test_app(&[], false).await;

        // Create with an explicit name.
        let response = app
            .clone()
            .oneshot(post("/api/chats", r#"{"name":"Trip planning"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        assert_eq!(created["name"], "Trip planning");
        let id = created["id"].as_str().unwrap().to_string();

        // Listed with id and name only.
        let response = app.clone().oneshot(get_req("/api/chats")).await.unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing[0]["id"], id.as_str());
        assert_eq!(listing[0]["name"], "Trip planning");

        // Rename syncs the detail view.
        let response = app
            .clone()
            .oneshot(post(&format!("/api/chats/{id}"), r#"{"name":"X"}"#))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], true);
        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/chats/{id}")))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["name"], "X");

        // Delete removes the record and the listing entry.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/chats/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], true);

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/chats/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app.oneshot(get_req("/api/chats")).await.unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn create_without_body_uses_the_default_name() {
        let (_tmp, app) = create_test_app(&[], false).await;
        let response = app.oneshot(post("/api/chats", "")).await.unwrap();
        let created = body_json(response).await;
        assert_eq!(created["name"], DEFAULT_CONVERSATION_NAME);
    }

    #[tokio::test]
    async fn messages_endpoints_overwrite_and_read_back() {
        let (_tmp, app) = create_test_app(&[], false).await;

        let response = app
            .clone()
            .oneshot(post("/api/chats", "{}"))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let payload = r#"{"messages":[{"role":"user","content":"Hello"}]}"#;
        let response = app
            .clone()
            .oneshot(post(&format!("/api/chats/{id}/messages"), payload))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], true);

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/chats/{id}/messages")))
            .await
            .unwrap();
        let messages = body_json(response).await;
        assert_eq!(messages[0]["content"], "Hello");

        // Missing record reads as an empty array, not an error.
        let response = app
            .oneshot(get_req(&format!(
                "/api/chats/{}/messages",
                Uuid::new_v4()
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn send_runs_the_controller_and_persists_the_exchange() {
        let (_tmp, app) = create_test_app(&["Hi"], false).await;

        let response = app
            .clone()
            .oneshot(post("/api/chats", "{}"))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post(
                &format!("/api/chats/{id}/send"),
                r#"{"message":"Hello"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = body_json(response).await;
        assert_eq!(reply["role"], "assistant");
        assert_eq!(reply["content"], "Hi");
        assert!(reply["meta"]["ttfbMs"].is_number());

        let response = app
            .oneshot(get_req(&format!("/api/chats/{id}/messages")))
            .await
            .unwrap();
        let messages = body_json(response).await;
        assert_eq!(messages.as_array().unwrap().len(), 2);
        assert_eq!(messages[0]["content"], "Hello");
        assert_eq!(messages[1]["content"], "Hi");
    }

    #[tokio::test]
    async fn send_to_a_missing_conversation_is_404() {
        let (_tmp, app) = create_test_app(&["Hi"], false).await;
        let response = app
            .oneshot(post(
                &format!("/api/chats/{}/send", Uuid::new_v4()),
                r#"{"message":"Hello"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
