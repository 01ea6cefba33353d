use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ChatId, SessionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct SessionEntry {
    user_id: UserId,
    sender: EventSender,
}

#[derive(Default)]
struct SessionTable {
    next_id: i64,
    sessions: HashMap<SessionId, SessionEntry>,
}

/// Maps user identities to their live connections. A user may hold several
/// concurrent sessions (devices, tabs); all of them receive broadcasts.
pub struct SessionRegistry {
    inner: Mutex<SessionTable>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionTable::default()),
        }
    }

    pub async fn register(&self, user_id: UserId, sender: EventSender) -> SessionId {
        let mut table = self.inner.lock().await;
        table.next_id += 1;
        let session_id = SessionId(table.next_id);
        table.sessions.insert(session_id, SessionEntry { user_id, sender });
        session_id
    }

    pub async fn unregister(&self, session_id: SessionId) -> Option<UserId> {
        let mut table = self.inner.lock().await;
        table.sessions.remove(&session_id).map(|entry| entry.user_id)
    }

    pub async fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        let table = self.inner.lock().await;
        table.sessions.get(&session_id).map(|entry| entry.user_id)
    }

    pub async fn sessions_for(&self, user_id: UserId) -> Vec<SessionId> {
        let table = self.inner.lock().await;
        table
            .sessions
            .iter()
            .filter(|(_, entry)| entry.user_id == user_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Delivery to one session is recipient-local: a closed channel is the
    /// session's own problem and never surfaces to the sender.
    pub async fn send_to(&self, session_id: SessionId, event: ServerEvent) {
        let table = self.inner.lock().await;
        if let Some(entry) = table.sessions.get(&session_id) {
            if entry.sender.send(event).is_err() {
                warn!(session_id = session_id.0, "ws: dropping event for half-closed session");
            }
        }
    }

    pub async fn broadcast_all(&self, event: &ServerEvent) {
        let table = self.inner.lock().await;
        for (session_id, entry) in table.sessions.iter() {
            if entry.sender.send(event.clone()).is_err() {
                warn!(session_id = session_id.0, "ws: dropping event for half-closed session");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<ChatId, HashSet<SessionId>>,
    focused: HashMap<SessionId, ChatId>,
}

/// Maps a chat id to the set of sessions subscribed to it. Rooms are created
/// lazily on first subscription and dropped once their member set empties.
pub struct RoomRegistry {
    inner: Mutex<RoomTable>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RoomTable::default()),
        }
    }

    pub async fn subscribe(&self, session_id: SessionId, chat_id: ChatId) {
        let mut table = self.inner.lock().await;
        table.rooms.entry(chat_id).or_default().insert(session_id);
    }

    pub async fn unsubscribe(&self, session_id: SessionId, chat_id: ChatId) {
        let mut table = self.inner.lock().await;
        if let Some(members) = table.rooms.get_mut(&chat_id) {
            members.remove(&session_id);
            if members.is_empty() {
                table.rooms.remove(&chat_id);
            }
        }
    }

    /// A session focuses at most one chat at a time for read-receipt intent.
    pub async fn focus(&self, session_id: SessionId, chat_id: Option<ChatId>) {
        let mut table = self.inner.lock().await;
        match chat_id {
            Some(chat_id) => {
                table.focused.insert(session_id, chat_id);
            }
            None => {
                table.focused.remove(&session_id);
            }
        }
    }

    pub async fn focused_chat(&self, session_id: SessionId) -> Option<ChatId> {
        self.inner.lock().await.focused.get(&session_id).copied()
    }

    pub async fn members_of(&self, chat_id: ChatId) -> Vec<SessionId> {
        let table = self.inner.lock().await;
        table
            .rooms
            .get(&chat_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn remove_session(&self, session_id: SessionId) {
        let mut table = self.inner.lock().await;
        table.rooms.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
        table.focused.remove(&session_id);
    }

    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn user_may_hold_multiple_sessions() {
        let sessions = SessionRegistry::new();
        let (tx_a, _rx_a) = sender();
        let (tx_b, _rx_b) = sender();
        let first = sessions.register(UserId(1), tx_a).await;
        let second = sessions.register(UserId(1), tx_b).await;
        assert_ne!(first, second);

        let mut found = sessions.sessions_for(UserId(1)).await;
        found.sort();
        assert_eq!(found, vec![first, second]);

        assert_eq!(sessions.unregister(first).await, Some(UserId(1)));
        assert_eq!(sessions.sessions_for(UserId(1)).await, vec![second]);
    }

    #[tokio::test]
    async fn broadcast_survives_closed_recipient() {
        let sessions = SessionRegistry::new();
        let (tx_dead, rx_dead) = sender();
        let (tx_live, mut rx_live) = sender();
        sessions.register(UserId(1), tx_dead).await;
        sessions.register(UserId(2), tx_live).await;
        drop(rx_dead);

        sessions
            .broadcast_all(&ServerEvent::ChatDeleted { chat_id: ChatId(9) })
            .await;
        assert!(matches!(
            rx_live.recv().await,
            Some(ServerEvent::ChatDeleted { chat_id: ChatId(9) })
        ));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_rooms_are_garbage_collected() {
        let rooms = RoomRegistry::new();
        let session = SessionId(1);
        rooms.subscribe(session, ChatId(5)).await;
        rooms.subscribe(session, ChatId(5)).await;
        assert_eq!(rooms.members_of(ChatId(5)).await, vec![session]);
        assert_eq!(rooms.room_count().await, 1);

        rooms.unsubscribe(session, ChatId(5)).await;
        assert!(rooms.members_of(ChatId(5)).await.is_empty());
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn remove_session_clears_rooms_and_focus() {
        let rooms = RoomRegistry::new();
        let session = SessionId(1);
        rooms.subscribe(session, ChatId(1)).await;
        rooms.subscribe(session, ChatId(2)).await;
        rooms.focus(session, Some(ChatId(1))).await;

        rooms.remove_session(session).await;
        assert_eq!(rooms.room_count().await, 0);
        assert!(rooms.focused_chat(session).await.is_none());
    }

    #[tokio::test]
    async fn focus_replaces_previous_focus() {
        let rooms = RoomRegistry::new();
        let session = SessionId(1);
        rooms.focus(session, Some(ChatId(1))).await;
        rooms.focus(session, Some(ChatId(2))).await;
        assert_eq!(rooms.focused_chat(session).await, Some(ChatId(2)));
        rooms.focus(session, None).await;
        assert!(rooms.focused_chat(session).await.is_none());
    }
}
