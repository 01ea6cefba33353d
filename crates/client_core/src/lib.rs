use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatPayload, ClientControl, MessageBody, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod connection;
pub mod error;
pub mod store;

use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, SubscriptionIntent, TokenSource,
};
use error::ClientError;
use store::{ChatEntry, ChatKey, MessageEntry, ReconciliationStore};

/// How long an optimistic send may stay in flight before it is shown as
/// failed. A confirmation arriving after the timeout still reconciles.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connection(ConnectionState),
    Server(ServerEvent),
    Error(String),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateChatRequest<'a> {
    peer_user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    body: &'a MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_tag: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateChatResponse {
    chat: ChatPayload,
    message: MessagePayload,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    body: &'a MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_tag: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    body: &'a MessageBody,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    messages: Vec<MessagePayload>,
    has_more: bool,
    #[allow(dead_code)]
    next_cursor: Option<i64>,
}

struct SessionTokenSource {
    token: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl TokenSource for SessionTokenSource {
    async fn token(&self) -> Result<String, ClientError> {
        self.token
            .lock()
            .await
            .clone()
            .ok_or_else(|| ClientError::AuthExpired("not logged in".into()))
    }
}

struct StoreIntent {
    store: Arc<Mutex<ReconciliationStore>>,
}

#[async_trait]
impl SubscriptionIntent for StoreIntent {
    async fn rooms(&self) -> Vec<ChatId> {
        self.store.lock().await.active_rooms()
    }

    async fn focused(&self) -> Option<ChatId> {
        self.store.lock().await.focused().and_then(|key| key.chat_id())
    }
}

/// High-level client combining the REST surface, the WebSocket connection
/// and the local reconciliation store.
pub struct ChatClient {
    http: Client,
    server_url: String,
    token: Arc<Mutex<Option<String>>>,
    store: Arc<Mutex<ReconciliationStore>>,
    connection: Mutex<Option<Arc<ConnectionManager>>>,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            token: Arc::new(Mutex::new(None)),
            store: Arc::new(Mutex::new(ReconciliationStore::new(UserId(0)))),
            connection: Mutex::new(None),
            events,
            pump: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn bearer(&self) -> Result<String, ClientError> {
        self.token
            .lock()
            .await
            .clone()
            .map(|token| format!("Bearer {token}"))
            .ok_or_else(|| ClientError::AuthExpired("not logged in".into()))
    }

    /// Logs in, initializes the store for this user and starts the
    /// connection loop. Returns the authenticated user id.
    pub async fn login(self: &Arc<Self>, username: &str) -> Result<UserId, ClientError> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest { username })
            .send()
            .await?;
        let response = expect_ok(response).await?;
        let body: LoginResponse = response.json().await?;
        let user_id = UserId(body.user_id);

        // A repeated login replaces the previous session wholesale; the old
        // reconnect loop and pump must not outlive their store.
        if let Some(previous) = self.connection.lock().await.take() {
            previous.close().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }

        *self.token.lock().await = Some(body.token);
        *self.store.lock().await = ReconciliationStore::new(user_id);

        let connection = ConnectionManager::new(
            self.server_url.clone(),
            Arc::new(SessionTokenSource {
                token: Arc::clone(&self.token),
            }),
        );
        let receiver = connection.subscribe();
        self.spawn_event_pump(receiver).await;
        connection
            .start(Arc::new(StoreIntent {
                store: Arc::clone(&self.store),
            }))
            .await;
        *self.connection.lock().await = Some(connection);

        info!(user_id = user_id.0, "client: logged in");
        Ok(user_id)
    }

    async fn spawn_event_pump(self: &Arc<Self>, mut receiver: broadcast::Receiver<ConnectionEvent>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(ConnectionEvent::Server(event)) => {
                        client.store.lock().await.apply_event(&event);
                        let _ = client.events.send(ClientEvent::Server(event));
                    }
                    Ok(ConnectionEvent::StateChanged(state)) => {
                        if state == ConnectionState::Connected {
                            if let Err(err) = client.resync().await {
                                let _ = client
                                    .events
                                    .send(ClientEvent::Error(format!("resync failed: {err}")));
                            }
                        }
                        let _ = client.events.send(ClientEvent::Connection(state));
                        if state == ConnectionState::Closed {
                            break;
                        }
                    }
                    Ok(ConnectionEvent::Error(err)) => {
                        let _ = client.events.send(ClientEvent::Error(err));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: event pump lagged; forcing resync");
                        if let Err(err) = client.resync().await {
                            let _ = client
                                .events
                                .send(ClientEvent::Error(format!("resync failed: {err}")));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump.lock().await = Some(handle);
    }

    /// Fetches the authoritative chat list and merges it into the store.
    /// The focused chat additionally gets its newest message page refetched,
    /// so messages that arrived during an outage show up without waiting for
    /// the user to scroll.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let chats: Vec<ChatPayload> = self.get_json(&format!("{}/chats", self.server_url)).await?;
        let focused = {
            let mut store = self.store.lock().await;
            store.resync(chats);
            store.focused()
        };
        if let Some(chat_id) = focused.and_then(|key| key.chat_id()) {
            let page: MessagePage = self
                .get_json(&format!(
                    "{}/chats/{}/messages?limit=50",
                    self.server_url, chat_id.0
                ))
                .await?;
            self.store
                .lock()
                .await
                .merge_history(ChatKey::Real(chat_id), &page.messages);
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(url)
            .header("authorization", self.bearer().await?)
            .send()
            .await?;
        let response = expect_ok(response).await?;
        Ok(response.json().await?)
    }

    async fn send_control(&self, control: ClientControl) -> Result<(), ClientError> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) => connection.send_control(control).await,
            None => Err(ClientError::Transport("not connected".into())),
        }
    }

    /// Opens a local-only chat with `peer`; no server round trip happens
    /// until the first message is sent.
    pub async fn open_preview(&self, peer: UserId) -> ChatKey {
        self.store.lock().await.open_preview(peer)
    }

    /// Focuses a chat: local unread resets, the server is told where read
    /// receipts should originate, and existing messages are marked read.
    pub async fn focus_chat(&self, key: Option<ChatKey>) -> Result<(), ClientError> {
        self.store.lock().await.focus(key);
        let chat_id = key.and_then(|key| key.chat_id());
        if let Some(chat_id) = chat_id {
            if let Err(err) = self.send_control(ClientControl::SubscribeRoom { chat_id }).await {
                warn!(%err, "client: subscribe control not delivered");
            }
        }
        if let Err(err) = self.send_control(ClientControl::FocusRoom { chat_id }).await {
            warn!(%err, "client: focus control not delivered");
        }
        if let Some(chat_id) = chat_id {
            let response = self
                .http
                .post(format!("{}/chats/{}/read", self.server_url, chat_id.0))
                .header("authorization", self.bearer().await?)
                .send()
                .await?;
            expect_ok(response).await?;
        }
        Ok(())
    }

    /// Optimistically sends a message to an existing chat. The pending entry
    /// appears immediately; confirmation or failure reconciles it.
    pub async fn send_message(
        &self,
        key: ChatKey,
        body: MessageBody,
    ) -> Result<MessagePayload, ClientError> {
        if body.is_empty() {
            return Err(ClientError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }
        let chat_id = key.chat_id().ok_or_else(|| {
            ClientError::Validation("chat has no server id yet; send the first message".into())
        })?;
        let client_tag = self
            .store
            .lock()
            .await
            .begin_send(key, body.clone())
            .ok_or_else(|| ClientError::NotFound("unknown chat".into()))?;

        let request = self
            .http
            .post(format!(
                "{}/chats/{}/messages",
                self.server_url, chat_id.0
            ))
            .header("authorization", self.bearer().await?)
            .json(&SendMessageRequest {
                body: &body,
                client_tag: Some(&client_tag),
            })
            .send();

        let outcome = match tokio::time::timeout(SEND_TIMEOUT, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                let message: MessagePayload = response.json().await?;
                Ok(message)
            }
            Ok(Ok(response)) => Err(ClientError::from_response(response).await),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ClientError::Transport("send timed out".into())),
        };

        let mut store = self.store.lock().await;
        match outcome {
            Ok(message) => {
                store.confirm_send(&client_tag, &message);
                Ok(message)
            }
            Err(err) => {
                // A late websocket echo carrying the tag still promotes the
                // entry; until then it shows as failed.
                store.fail_send(&client_tag);
                Err(err)
            }
        }
    }

    /// Creates the real chat from a preview by sending its first message.
    pub async fn send_first_message(
        &self,
        key: ChatKey,
        name: Option<&str>,
        body: MessageBody,
    ) -> Result<ChatPayload, ClientError> {
        if body.is_empty() {
            return Err(ClientError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }
        let (peer, client_tag) = {
            let mut store = self.store.lock().await;
            let self_id = store.self_user_id();
            let peer = store
                .chat(key)
                .and_then(|entry| {
                    entry
                        .member_ids
                        .iter()
                        .copied()
                        .find(|member| *member != self_id)
                })
                .ok_or_else(|| ClientError::NotFound("unknown preview chat".into()))?;
            let client_tag = store
                .begin_send(key, body.clone())
                .ok_or_else(|| ClientError::NotFound("unknown preview chat".into()))?;
            (peer, client_tag)
        };

        let request = self
            .http
            .post(format!("{}/chats", self.server_url))
            .header("authorization", self.bearer().await?)
            .json(&CreateChatRequest {
                peer_user_id: peer.0,
                name,
                body: &body,
                client_tag: Some(&client_tag),
            })
            .send();

        let outcome = match tokio::time::timeout(SEND_TIMEOUT, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                let created: CreateChatResponse = response.json().await?;
                Ok(created)
            }
            Ok(Ok(response)) => Err(ClientError::from_response(response).await),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ClientError::Transport("send timed out".into())),
        };

        match outcome {
            Ok(created) => {
                self.store
                    .lock()
                    .await
                    .promote_preview(key, &created.chat, &created.message);
                let chat_id = created.chat.chat_id;
                if let Err(err) = self.send_control(ClientControl::SubscribeRoom { chat_id }).await
                {
                    warn!(%err, "client: subscribe control not delivered");
                }
                Ok(created.chat)
            }
            Err(err) => {
                // The preview keeps the unsent first message for retry.
                self.store.lock().await.fail_send(&client_tag);
                Err(err)
            }
        }
    }

    pub async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        body: MessageBody,
    ) -> Result<MessagePayload, ClientError> {
        if body.is_empty() {
            return Err(ClientError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }
        let response = self
            .http
            .put(format!(
                "{}/chats/{}/messages/{}",
                self.server_url, chat_id.0, message_id.0
            ))
            .header("authorization", self.bearer().await?)
            .json(&EditMessageRequest { body: &body })
            .send()
            .await?;
        let response = expect_ok(response).await?;
        let message: MessagePayload = response.json().await?;
        // Applied locally right away; the websocket echo is a no-op.
        self.store.lock().await.apply_event(&ServerEvent::MessageUpdated {
            chat_id,
            message_id,
            message: message.clone(),
        });
        Ok(message)
    }

    pub async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(format!(
                "{}/chats/{}/messages/{}",
                self.server_url, chat_id.0, message_id.0
            ))
            .header("authorization", self.bearer().await?)
            .send()
            .await?;
        expect_ok(response).await?;
        self.store
            .lock()
            .await
            .apply_event(&ServerEvent::MessageDeleted { chat_id, message_id });
        Ok(())
    }

    /// Loads one older page of history into the store. Returns whether more
    /// history remains beyond the fetched page.
    pub async fn load_older_messages(
        &self,
        key: ChatKey,
        limit: u32,
    ) -> Result<bool, ClientError> {
        let chat_id = key
            .chat_id()
            .ok_or_else(|| ClientError::NotFound("chat has no server id yet".into()))?;
        let before = {
            let store = self.store.lock().await;
            store.messages(key).and_then(|messages| {
                messages.iter().find_map(|entry| match entry {
                    MessageEntry::Confirmed(message) => Some(message.message_id.0),
                    MessageEntry::Pending(_) => None,
                })
            })
        };

        let mut url = format!(
            "{}/chats/{}/messages?limit={limit}",
            self.server_url, chat_id.0
        );
        if let Some(before) = before {
            url.push_str(&format!("&before={before}"));
        }
        let page: MessagePage = self.get_json(&url).await?;
        self.store.lock().await.merge_history(key, &page.messages);
        Ok(page.has_more)
    }

    pub async fn chat_list(&self) -> Vec<ChatEntry> {
        self.store
            .lock()
            .await
            .chat_list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn messages(&self, key: ChatKey) -> Vec<MessageEntry> {
        self.store
            .lock()
            .await
            .messages(key)
            .map(|messages| messages.to_vec())
            .unwrap_or_default()
    }

    pub async fn unread(&self, key: ChatKey) -> u32 {
        self.store.lock().await.unread(key)
    }

    /// Tears down the connection loop and the event pump.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }
}

async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ClientError::from_response(response).await)
    }
}

#[cfg(test)]
mod tests;
