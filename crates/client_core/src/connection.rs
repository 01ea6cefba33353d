use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::ChatId,
    protocol::{ClientControl, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::error::ClientError;

pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
/// A session must hold at least this long before the backoff counter resets;
/// a server that drops sockets right after the handshake keeps escalating.
pub const STABLE_SESSION: Duration = Duration::from_secs(5);

/// Delay before reconnect attempt number `attempt` (zero-based). Doubles per
/// attempt and saturates at [`RETRY_MAX_DELAY`].
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY)
}

/// Supplies the bearer token for the next connection attempt. Called
/// immediately before every attempt so a refreshed credential is always used.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, ClientError>;
}

pub struct StaticTokenSource(String);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}

/// What to re-establish after a (re)connect: server-side room subscriptions
/// do not survive a dropped socket.
#[async_trait]
pub trait SubscriptionIntent: Send + Sync {
    async fn rooms(&self) -> Vec<ChatId>;
    async fn focused(&self) -> Option<ChatId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; reached only through [`ConnectionManager::close`].
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Server(ServerEvent),
    Error(String),
}

/// Maintains one WebSocket to the server, reconnecting with capped
/// exponential backoff until [`close`](Self::close) is called.
pub struct ConnectionManager {
    server_url: String,
    token_source: Arc<dyn TokenSource>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    control: Mutex<Option<mpsc::UnboundedSender<ClientControl>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(server_url: impl Into<String>, token_source: Arc<dyn TokenSource>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            server_url: server_url.into(),
            token_source,
            events,
            state,
            control: Mutex::new(None),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    fn ws_url(&self, token: &str) -> Result<String, ClientError> {
        let base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ClientError::Validation(
                "server url must start with http:// or https://".into(),
            ));
        };
        Ok(format!("{base}/ws?token={token}"))
    }

    /// Starts the background connect/reconnect loop. `intent` is consulted
    /// after every successful connect to restore subscriptions.
    pub async fn start(self: &Arc<Self>, intent: Arc<dyn SubscriptionIntent>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run(intent).await;
        });
        *self.task.lock().await = Some(handle);
    }

    async fn run(self: Arc<Self>, intent: Arc<dyn SubscriptionIntent>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let started = Instant::now();

            let outcome = self.connect_once(&intent, &mut shutdown).await;
            self.control.lock().await.take();
            match outcome {
                Ok(true) => break,
                Ok(false) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    // Only a session that actually held for a while earns a
                    // fresh backoff. A peer dropping the socket straight
                    // after the handshake is treated like a failed attempt.
                    if started.elapsed() >= STABLE_SESSION {
                        attempt = 0;
                    }
                }
                Err(err) => {
                    let _ = self.events.send(ConnectionEvent::Error(err.to_string()));
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = retry_delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "ws: reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.control.lock().await.take();
        self.set_state(ConnectionState::Closed);
    }

    /// One connection attempt plus the session it yields. Returns Ok(true)
    /// if the session ended because of an explicit close, Ok(false) if the
    /// peer dropped an established connection.
    async fn connect_once(
        &self,
        intent: &Arc<dyn SubscriptionIntent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, ClientError> {
        let token = self.token_source.token().await?;
        let url = self.ws_url(&token)?;

        let (stream, _) = connect_async(&url)
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        for chat_id in intent.rooms().await {
            let control = ClientControl::SubscribeRoom { chat_id };
            send_control_frame(&mut writer, &control).await?;
        }
        let focus = ClientControl::FocusRoom {
            chat_id: intent.focused().await,
        };
        send_control_frame(&mut writer, &focus).await?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ClientControl>();
        *self.control.lock().await = Some(control_tx);
        // Connected is announced only after subscriptions went out, so an
        // owner reacting with a resync observes a fully restored session.
        self.set_state(ConnectionState::Connected);
        info!(url = %self.server_url, "ws: connected");

        loop {
            tokio::select! {
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                let _ = self.events.send(ConnectionEvent::Server(event));
                            }
                            Err(err) => {
                                let _ = self.events.send(ConnectionEvent::Error(
                                    format!("invalid server event: {err}"),
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(false),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = self.events.send(ConnectionEvent::Error(err.to_string()));
                        return Ok(false);
                    }
                },
                outgoing = control_rx.recv() => match outgoing {
                    Some(control) => send_control_frame(&mut writer, &control).await?,
                    None => return Ok(false),
                },
                _ = shutdown.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }

    /// Queues a control message on the live connection.
    pub async fn send_control(&self, control: ClientControl) -> Result<(), ClientError> {
        let guard = self.control.lock().await;
        match guard.as_ref() {
            Some(tx) if tx.send(control).is_ok() => Ok(()),
            _ => Err(ClientError::Transport("not connected".into())),
        }
    }

    /// Stops reconnecting and closes any live connection. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn send_control_frame<S>(writer: &mut S, control: &ClientControl) -> Result<(), ClientError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(control)
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))
}
