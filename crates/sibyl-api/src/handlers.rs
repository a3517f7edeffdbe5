//! Route handler functions for the persistence REST surface.
//!
//! Each handler extracts query/path parameters via axum extractors,
//! validates the request before any state mutation, calls into the
//! repository pair, and returns JSON responses.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sibyl_core::types::{Chat, Message, User, UserRole};

use crate::error::ApiError;
use crate::state::AppState;

/// Attempts for chat creation when the generated identifier collides.
const CREATE_CHAT_ATTEMPTS: usize = 3;

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub email: String,
    pub first_message: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailParams {
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: UserRole,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub chat: Chat,
}

#[derive(Debug, Serialize)]
pub struct ChatsResponse {
    pub chats: Vec<Chat>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health - liveness and selected backend.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: format!("{:?}", state.storage.backend).to_lowercase(),
    })
}

/// POST /chat - create a chat seeded with the user's first message.
pub async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if body.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email is required".to_string()));
    }
    if body.first_message.trim().is_empty() {
        return Err(ApiError::BadRequest("first_message is required".to_string()));
    }

    let user = state
        .storage
        .users
        .get_user_by_email(&body.email)?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", body.email)))?;

    let seed = Message::user(body.first_message.as_str());

    // A duplicate generated identifier is retried here, by the caller of
    // the repository, with a freshly allocated id each attempt.
    let mut last_conflict = None;
    let mut created = None;
    for _ in 0..CREATE_CHAT_ATTEMPTS {
        match state.storage.chats.create_chat(&body.title, &seed) {
            Ok(chat) => {
                created = Some(chat);
                break;
            }
            Err(sibyl_core::error::SibylError::Conflict(msg)) => {
                warn!(conflict = %msg, "Chat identifier collision, retrying");
                last_conflict = Some(msg);
            }
            Err(e) => return Err(e.into()),
        }
    }
    let chat = created.ok_or_else(|| {
        ApiError::Conflict(last_conflict.unwrap_or_else(|| "chat id exhausted".to_string()))
    })?;

    state.storage.users.add_chat_to_user(&user.email, &chat.id)?;
    info!(chat_id = %chat.id, email = %user.email, "Chat created");

    Ok(Json(ChatResponse { chat }))
}

/// GET /chat?email= - all chats owned by the user.
pub async fn list_chats(
    State(state): State<AppState>,
    Query(params): Query<EmailParams>,
) -> Result<Json<ChatsResponse>, ApiError> {
    let email = params
        .email
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("email is required".to_string()))?;

    let user = state
        .storage
        .users
        .get_user_by_email(&email)?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", email)))?;

    let mut chats = Vec::with_capacity(user.chats.len());
    for chat_id in &user.chats {
        if let Some(chat) = state.storage.chats.get_chat_by_id(chat_id)? {
            chats.push(chat);
        }
    }

    Ok(Json(ChatsResponse { chats }))
}

/// POST /chat/{id} - append one message to an existing chat.
pub async fn append_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(message): Json<Message>,
) -> Result<Json<Message>, ApiError> {
    let stored = state.storage.chats.append_message(&chat_id, &message)?;
    Ok(Json(stored))
}

/// GET /chat/{id} - all messages for the chat in chronological order.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let messages = state.storage.chats.get_messages(&chat_id)?;
    Ok(Json(MessagesResponse { messages }))
}

/// POST /user - idempotent user registration.
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if body.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email is required".to_string()));
    }

    let user = User {
        email: body.email,
        name: body.name,
        role: body.role,
        chats: Vec::new(),
    };
    let stored = state.storage.users.create_user(&user)?;
    Ok(Json(UserResponse { user: stored }))
}

/// GET /user?email= - look up a user record.
pub async fn get_user(
    State(state): State<AppState>,
    Query(params): Query<EmailParams>,
) -> Result<Json<UserResponse>, ApiError> {
    let email = params
        .email
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("email is required".to_string()))?;

    let user = state
        .storage
        .users
        .get_user_by_email(&email)?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", email)))?;

    Ok(Json(UserResponse { user }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use sibyl_core::config::SibylConfig;
    use sibyl_storage::{Storage, StorageBackend};

    fn make_app(backend: StorageBackend) -> axum::Router {
        let storage = Storage::in_memory(backend).unwrap();
        let state = AppState::new(SibylConfig::default(), storage);
        crate::routes::create_router(state)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register_user(app: &axum::Router, email: &str) {
        let resp = app
            .clone()
            .oneshot(post("/user", json!({"email": email, "name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn create_chat_for(app: &axum::Router, email: &str, first: &str) -> String {
        let resp = app
            .clone()
            .oneshot(post(
                "/chat",
                json!({"email": email, "first_message": first, "title": "t"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        body["chat"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let app = make_app(StorageBackend::Partitioned);
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "partitioned");
    }

    #[tokio::test]
    async fn test_create_chat_unknown_user_is_404() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(post(
                "/chat",
                json!({"email": "ghost@x.y", "first_message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_chat_missing_fields_is_400() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .clone()
            .oneshot(post("/chat", json!({"email": "", "first_message": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post("/chat", json!({"email": "a@b.c", "first_message": " "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_chat_returns_seed_and_links_user() {
        let app = make_app(StorageBackend::Embedded);
        register_user(&app, "a@b.c").await;

        let resp = app
            .clone()
            .oneshot(post(
                "/chat",
                json!({"email": "a@b.c", "first_message": "hello", "title": "First"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["chat"]["title"], "First");
        assert_eq!(body["chat"]["messages"][0]["content"], "hello");
        assert_eq!(body["chat"]["messages"][0]["role"], "user");

        // The chat shows up under the owner.
        let resp = app
            .oneshot(
                Request::get("/chat?email=a@b.c")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["chats"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_chats_unknown_user_is_404() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(
                Request::get("/chat?email=ghost@x.y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_chats_missing_email_is_400() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(Request::get("/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_append_and_read_back_in_order_both_backends() {
        for backend in [StorageBackend::Embedded, StorageBackend::Partitioned] {
            let app = make_app(backend);
            register_user(&app, "a@b.c").await;
            let chat_id = create_chat_for(&app, "a@b.c", "m0").await;

            for i in 1..=4 {
                let resp = app
                    .clone()
                    .oneshot(post(
                        &format!("/chat/{}", chat_id),
                        json!({"role": "user", "content": format!("m{}", i)}),
                    ))
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::OK, "backend {:?}", backend);
            }

            let resp = app
                .oneshot(
                    Request::get(format!("/chat/{}", chat_id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = body_json(resp).await;
            let messages = body["messages"].as_array().unwrap();
            assert_eq!(messages.len(), 5, "backend {:?}", backend);
            for (i, msg) in messages.iter().enumerate() {
                assert_eq!(msg["content"], format!("m{}", i));
            }
        }
    }

    #[tokio::test]
    async fn test_append_to_unknown_chat_is_404() {
        let app = make_app(StorageBackend::Partitioned);
        let resp = app
            .oneshot(post(
                "/chat/no-such-chat",
                json!({"role": "user", "content": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_messages_unknown_chat_is_404() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(
                Request::get("/chat/no-such-chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_append_message_with_references_round_trips() {
        let app = make_app(StorageBackend::Partitioned);
        register_user(&app, "a@b.c").await;
        let chat_id = create_chat_for(&app, "a@b.c", "q").await;

        let resp = app
            .clone()
            .oneshot(post(
                &format!("/chat/{}", chat_id),
                json!({
                    "role": "assistant",
                    "content": "answer [1]",
                    "sourceDocs": [
                        {"title": "Reference [1]", "url": "http://a", "pages": "2-3"}
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stored = body_json(resp).await;
        // Server assigned a timestamp.
        assert!(stored["timestamp"].is_string());

        let resp = app
            .oneshot(
                Request::get(format!("/chat/{}", chat_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["sourceDocs"][0]["url"], "http://a");
        assert_eq!(last["sourceDocs"][0]["pages"], "2-3");
    }

    #[tokio::test]
    async fn test_create_user_is_idempotent() {
        let app = make_app(StorageBackend::Embedded);

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(post("/user", json!({"email": "a@b.c", "name": "Ada"})))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app
            .oneshot(
                Request::get("/user?email=a@b.c")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["user"]["name"], "Ada");
    }

    #[tokio::test]
    async fn test_create_user_missing_email_is_400() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(post("/user", json!({"email": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_user_is_404() {
        let app = make_app(StorageBackend::Embedded);
        let resp = app
            .oneshot(
                Request::get("/user?email=ghost@x.y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
