use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatPayload, ClientControl, MessageBody, MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

mod config;
mod dispatch;
mod registry;

use config::{load_settings, prepare_database_url};
use dispatch::{overview_to_payload, payload_from, Dispatcher};

struct AppState {
    dispatcher: Dispatcher,
    tokens: Mutex<HashMap<String, UserId>>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    peer_user_id: i64,
    name: Option<String>,
    body: MessageBody,
    #[serde(default)]
    client_tag: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateChatResponse {
    chat: ChatPayload,
    message: MessagePayload,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    body: MessageBody,
    #[serde(default)]
    client_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    body: MessageBody,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Serialize)]
struct MessagePage {
    messages: Vec<MessagePayload>,
    has_more: bool,
    next_cursor: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        dispatcher: Dispatcher::new(storage),
        tokens: Mutex::new(HashMap::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/chats", get(list_chats))
        .route("/chats", post(create_chat))
        .route("/chats/:chat_id/messages", get(list_messages))
        .route("/chats/:chat_id/messages", post(create_message))
        .route("/chats/:chat_id/messages/:message_id", put(edit_message))
        .route("/chats/:chat_id/messages/:message_id", delete(delete_message))
        .route("/chats/:chat_id/read", post(mark_read))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, Rejection> {
    state
        .dispatcher
        .storage()
        .health_check()
        .await
        .map_err(persistence)?;
    Ok("ok")
}

type Rejection = (StatusCode, Json<ApiError>);

fn reject(err: ApiError) -> Rejection {
    let status = match err.code {
        ErrorCode::AuthExpired => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

fn persistence(err: anyhow::Error) -> Rejection {
    reject(ApiError::new(ErrorCode::Persistence, err.to_string()))
}

async fn authenticate_token(state: &AppState, token: &str) -> Result<UserId, Rejection> {
    let tokens = state.tokens.lock().await;
    tokens.get(token).copied().ok_or_else(|| {
        reject(ApiError::new(
            ErrorCode::AuthExpired,
            "token is unknown or expired",
        ))
    })
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, Rejection> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::AuthExpired,
                "missing bearer token",
            ))
        })?;
    authenticate_token(state, token).await
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Rejection> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "username must not be empty",
        )));
    }

    let user_id = state
        .dispatcher
        .storage()
        .create_user(username)
        .await
        .map_err(persistence)?;

    let token = uuid::Uuid::new_v4().to_string();
    state.tokens.lock().await.insert(token.clone(), user_id);
    info!(user_id = user_id.0, "login: token issued");

    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatPayload>>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let overviews = state
        .dispatcher
        .storage()
        .list_chats_for_user(user_id)
        .await
        .map_err(persistence)?;
    Ok(Json(overviews.into_iter().map(overview_to_payload).collect()))
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<CreateChatResponse>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let (chat, message) = state
        .dispatcher
        .create_chat(
            user_id,
            UserId(req.peer_user_id),
            req.name.as_deref(),
            &req.body,
            req.client_tag.as_deref(),
        )
        .await
        .map_err(reject)?;
    Ok(Json(CreateChatResponse { chat, message }))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let chat_id = ChatId(chat_id);
    let storage = state.dispatcher.storage();

    let is_member = storage.is_member(chat_id, user_id).await.map_err(persistence)?;
    if !is_member {
        return Err(reject(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a chat member",
        )));
    }

    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let (messages, has_more) = storage
        .list_chat_messages(chat_id, limit, q.before.map(MessageId))
        .await
        .map_err(persistence)?;
    let messages: Vec<MessagePayload> = messages.iter().map(payload_from).collect();
    let next_cursor = if has_more {
        messages.first().map(|m| m.message_id.0)
    } else {
        None
    };
    Ok(Json(MessagePage {
        messages,
        has_more,
        next_cursor,
    }))
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let message = state
        .dispatcher
        .create_message(
            ChatId(chat_id),
            user_id,
            &req.body,
            MessageKind::Ordinary,
            req.client_tag.as_deref(),
        )
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let message = state
        .dispatcher
        .edit_message(ChatId(chat_id), MessageId(message_id), user_id, &req.body)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((chat_id, message_id)): Path<(i64, i64)>,
) -> Result<StatusCode, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    state
        .dispatcher
        .delete_message(ChatId(chat_id), MessageId(message_id), user_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> Result<Json<ReadResponse>, Rejection> {
    let user_id = authenticate(&state, &headers).await?;
    let count = state
        .dispatcher
        .mark_read(ChatId(chat_id), user_id)
        .await
        .map_err(reject)?;
    Ok(Json(ReadResponse { count }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, Rejection> {
    let user_id = authenticate_token(&state, &q.token).await?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session_id = state.dispatcher.sessions.register(user_id, event_tx).await;
    info!(user_id = user_id.0, session_id = session_id.0, "ws: session registered");

    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientControl>(&text) {
                Ok(control) => {
                    handle_control(&state, session_id, user_id, control).await;
                }
                Err(err) => {
                    warn!(
                        session_id = session_id.0,
                        %err,
                        "ws: ignoring malformed control message"
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    state.dispatcher.disconnect_session(session_id).await;
    info!(user_id = user_id.0, session_id = session_id.0, "ws: session closed");
}

async fn handle_control(
    state: &AppState,
    session_id: shared::domain::SessionId,
    user_id: UserId,
    control: ClientControl,
) {
    match control {
        ClientControl::SubscribeRoom { chat_id } => {
            match state.dispatcher.storage().is_member(chat_id, user_id).await {
                Ok(true) => state.dispatcher.rooms.subscribe(session_id, chat_id).await,
                Ok(false) => {
                    state
                        .dispatcher
                        .sessions
                        .send_to(
                            session_id,
                            ServerEvent::Error(ApiError::new(
                                ErrorCode::Forbidden,
                                format!("not a member of chat {}", chat_id.0),
                            )),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(chat_id = chat_id.0, %err, "ws: membership check failed");
                }
            }
        }
        ClientControl::UnsubscribeRoom { chat_id } => {
            state.dispatcher.rooms.unsubscribe(session_id, chat_id).await;
        }
        ClientControl::FocusRoom { chat_id } => {
            state.dispatcher.rooms.focus(session_id, chat_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        Arc::new(AppState {
            dispatcher: Dispatcher::new(storage),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn login_user(app: &Router, username: &str) -> (i64, String) {
        let request = Request::post("/login")
            .header("content-type", "application/json")
            .body(Body::from(format!("{{\"username\":\"{username}\"}}")))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        (
            value["user_id"].as_i64().expect("user_id"),
            value["token"].as_str().expect("token").to_string(),
        )
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let app = build_router(test_state().await);
        let request = Request::get("/chats").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn message_lifecycle_over_rest() {
        let app = build_router(test_state().await);
        let (_alice_id, alice_token) = login_user(&app, "alice").await;
        let (bob_id, bob_token) = login_user(&app, "bob").await;

        // Alice opens a chat with Bob by sending the first message.
        let request = Request::post("/chats")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {alice_token}"))
            .body(Body::from(format!(
                "{{\"peer_user_id\":{bob_id},\"body\":{{\"text\":\"hello\"}},\"client_tag\":\"t1\"}}"
            )))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let created: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let chat_id = created["chat"]["chat_id"].as_i64().expect("chat_id");
        assert_eq!(created["message"]["client_tag"], "t1");

        // Bob sees the chat with one unread message.
        let request = Request::get("/chats")
            .header("authorization", format!("Bearer {bob_token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let chats: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(chats[0]["chat_id"].as_i64(), Some(chat_id));
        assert_eq!(chats[0]["unread"].as_u64(), Some(1));

        // Bob marks the chat read; the second call affects nothing.
        let read = |token: String| {
            Request::post(format!("/chats/{chat_id}/read"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request")
        };
        let response = app.clone().oneshot(read(bob_token.clone())).await.expect("response");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let first: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(first["count"].as_u64(), Some(1));
        let response = app.clone().oneshot(read(bob_token.clone())).await.expect("response");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let second: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(second["count"].as_u64(), Some(0));

        // The page lists the message in ascending order.
        let request = Request::get(format!("/chats/{chat_id}/messages?limit=10"))
            .header("authorization", format!("Bearer {bob_token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let page: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(page["messages"][0]["body"]["text"], "hello");
        assert_eq!(page["has_more"].as_bool(), Some(false));

        // An outsider cannot read the chat.
        let (_mallory_id, mallory_token) = login_user(&app, "mallory").await;
        let request = Request::get(format!("/chats/{chat_id}/messages"))
            .header("authorization", format!("Bearer {mallory_token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let app = build_router(test_state().await);
        let (_alice_id, alice_token) = login_user(&app, "alice").await;
        let (bob_id, _bob_token) = login_user(&app, "bob").await;

        let request = Request::post("/chats")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {alice_token}"))
            .body(Body::from(format!(
                "{{\"peer_user_id\":{bob_id},\"body\":{{\"text\":\"   \"}}}}"
            )))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
