use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::domain::ChatId;

use crate::{
    connection::{
        retry_delay, ConnectionManager, ConnectionState, StaticTokenSource, SubscriptionIntent,
        TokenSource, RETRY_MAX_DELAY,
    },
    error::ClientError,
};

struct NoIntent;

#[async_trait]
impl SubscriptionIntent for NoIntent {
    async fn rooms(&self) -> Vec<ChatId> {
        Vec::new()
    }

    async fn focused(&self) -> Option<ChatId> {
        None
    }
}

struct CountingTokenSource {
    calls: AtomicU32,
}

#[async_trait]
impl TokenSource for CountingTokenSource {
    async fn token(&self) -> Result<String, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("refreshed-token".into())
    }
}

#[test]
fn retry_delay_doubles_until_the_cap() {
    assert_eq!(retry_delay(0), Duration::from_millis(500));
    assert_eq!(retry_delay(1), Duration::from_secs(1));
    assert_eq!(retry_delay(2), Duration::from_secs(2));
    assert_eq!(retry_delay(5), Duration::from_secs(16));
    assert_eq!(retry_delay(6), RETRY_MAX_DELAY);
    assert_eq!(retry_delay(63), RETRY_MAX_DELAY);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_is_refreshed_before_every_attempt() {
    let tokens = Arc::new(CountingTokenSource {
        calls: AtomicU32::new(0),
    });
    // Nothing listens on the discard port, so every attempt fails fast.
    let manager = ConnectionManager::new("http://127.0.0.1:9", Arc::clone(&tokens) as Arc<dyn TokenSource>);
    manager.start(Arc::new(NoIntent)).await;

    tokio::time::sleep(Duration::from_millis(1800)).await;
    manager.close().await;

    assert!(
        tokens.calls.load(Ordering::SeqCst) >= 2,
        "expected at least two token refreshes, got {}",
        tokens.calls.load(Ordering::SeqCst)
    );
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn immediately_dropped_connections_back_off() {
    use axum::{extract::WebSocketUpgrade, response::IntoResponse, routing::get, Router};
    use tokio::net::TcpListener;

    let upgrades = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&upgrades);
    // Accepts the handshake, then drops the socket right away.
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ws.on_upgrade(|socket| async move { drop(socket) }).into_response()
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let manager = ConnectionManager::new(
        format!("http://{addr}"),
        Arc::new(StaticTokenSource::new("fixed-token")) as Arc<dyn TokenSource>,
    );
    manager.start(Arc::new(NoIntent)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.close().await;

    // Backoff (500ms, 1s, 2s, ...) allows only a handful of attempts in two
    // seconds; without it the count runs into the thousands.
    let attempts = upgrades.load(Ordering::SeqCst);
    assert!(
        (1..=6).contains(&attempts),
        "expected bounded reconnect attempts, got {attempts}"
    );
}

#[tokio::test]
async fn close_is_terminal() {
    let manager = ConnectionManager::new(
        "http://127.0.0.1:9",
        Arc::new(StaticTokenSource::new("fixed-token")) as Arc<dyn TokenSource>,
    );
    manager.start(Arc::new(NoIntent)).await;
    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Closed);

    // Controls after close are rejected instead of silently dropped.
    let result = manager
        .send_control(shared::protocol::ClientControl::FocusRoom { chat_id: None })
        .await;
    assert!(result.is_err());
}
