use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChatId, MessageId, MessageKind, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatPayload, LastMessagePayload, MessageBody, MessagePayload, ServerEvent},
};
use storage::{ChatOverview, Storage, StoredMessage};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::registry::{RoomRegistry, SessionRegistry};

/// Persists message mutations and fans the resulting events out to sessions.
/// One instance is shared by every connection task; mutations to the same
/// chat serialize through that chat's own critical section.
pub struct Dispatcher {
    storage: Storage,
    pub sessions: SessionRegistry,
    pub rooms: RoomRegistry,
    chat_locks: Mutex<HashMap<ChatId, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            sessions: SessionRegistry::new(),
            rooms: RoomRegistry::new(),
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    async fn chat_lock(&self, chat_id: ChatId) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        Arc::clone(locks.entry(chat_id).or_default())
    }

    /// Unregistering a session also removes it from every room it joined.
    pub async fn disconnect_session(&self, session_id: SessionId) {
        self.rooms.remove_session(session_id).await;
        self.sessions.unregister(session_id).await;
    }

    async fn ensure_membership(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ApiError> {
        let is_member = self
            .storage
            .is_member(chat_id, user_id)
            .await
            .map_err(persistence)?;
        if !is_member {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "user is not a chat member",
            ));
        }
        Ok(())
    }

    async fn broadcast_room(&self, chat_id: ChatId, event: ServerEvent) {
        for session_id in self.rooms.members_of(chat_id).await {
            self.sessions.send_to(session_id, event.clone()).await;
        }
    }

    pub async fn create_message(
        &self,
        chat_id: ChatId,
        author_id: UserId,
        body: &MessageBody,
        kind: MessageKind,
        client_tag: Option<&str>,
    ) -> Result<MessagePayload, ApiError> {
        if body.is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "message needs text or at least one attachment",
            ));
        }
        self.ensure_membership(chat_id, author_id).await?;

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let stored = self
            .storage
            .insert_message(chat_id, author_id, body, kind, client_tag)
            .await
            .map_err(persistence)?;
        let message = payload_from(&stored);
        info!(
            chat_id = chat_id.0,
            message_id = message.message_id.0,
            author_id = author_id.0,
            "dispatch: message created"
        );

        self.broadcast_room(
            chat_id,
            ServerEvent::MessageCreated {
                chat_id,
                message: message.clone(),
            },
        )
        .await;
        // Global summary so unsubscribed clients can reorder their chat list.
        self.sessions
            .broadcast_all(&ServerEvent::ChatSummaryChanged {
                chat_id,
                last_message: Some(LastMessagePayload::of(&message)),
                last_activity: message.created_at,
            })
            .await;

        // A session focused on this chat has it open on screen, so its user
        // reads the message the moment it lands. The chat lock is still held
        // here; mark_chat_read is hit directly instead of through mark_read.
        for session_id in self.rooms.members_of(chat_id).await {
            if self.rooms.focused_chat(session_id).await != Some(chat_id) {
                continue;
            }
            let Some(reader) = self.sessions.user_of(session_id).await else {
                continue;
            };
            if reader == author_id {
                continue;
            }
            // The message is already persisted and announced; a failed read
            // row must not turn the create into an error for the sender.
            match self.storage.mark_chat_read(chat_id, reader).await {
                Ok(count) if count > 0 => {
                    self.broadcast_room(
                        chat_id,
                        ServerEvent::ReadReceipt { chat_id, user_id: reader, count },
                    )
                    .await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        chat_id = chat_id.0,
                        user_id = reader.0,
                        error = %err,
                        "dispatch: focused read receipt failed"
                    );
                }
            }
        }

        Ok(message)
    }

    pub async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        author_id: UserId,
        body: &MessageBody,
    ) -> Result<MessagePayload, ApiError> {
        if body.is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "message needs text or at least one attachment",
            ));
        }
        self.ensure_membership(chat_id, author_id).await?;

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let existing = self.load_owned_message(chat_id, message_id, author_id).await?;
        let was_last = self.is_current_last(chat_id, message_id).await?;

        let updated = self
            .storage
            .update_message_body(message_id, body)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
        let message = payload_from(&updated);
        info!(
            chat_id = chat_id.0,
            message_id = message_id.0,
            "dispatch: message edited"
        );

        self.broadcast_room(
            chat_id,
            ServerEvent::MessageUpdated {
                chat_id,
                message_id,
                message: message.clone(),
            },
        )
        .await;
        // Summary changes only when the edit touched the cached last message.
        if was_last {
            self.sessions
                .broadcast_all(&ServerEvent::ChatSummaryChanged {
                    chat_id,
                    last_message: Some(LastMessagePayload::of(&message)),
                    last_activity: existing.created_at,
                })
                .await;
        }

        Ok(message)
    }

    pub async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        author_id: UserId,
    ) -> Result<(), ApiError> {
        self.ensure_membership(chat_id, author_id).await?;

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        self.load_owned_message(chat_id, message_id, author_id).await?;
        let was_last = self.is_current_last(chat_id, message_id).await?;

        self.storage
            .delete_message(message_id)
            .await
            .map_err(persistence)?;
        info!(
            chat_id = chat_id.0,
            message_id = message_id.0,
            "dispatch: message deleted"
        );

        self.broadcast_room(chat_id, ServerEvent::MessageDeleted { chat_id, message_id })
            .await;

        if was_last {
            let remaining = self.storage.last_message(chat_id).await.map_err(persistence)?;
            let last_activity = match &remaining {
                Some(message) => message.created_at,
                None => self
                    .storage
                    .chat_created_at(chat_id)
                    .await
                    .map_err(persistence)?
                    .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "chat not found"))?,
            };
            self.sessions
                .broadcast_all(&ServerEvent::ChatSummaryChanged {
                    chat_id,
                    last_message: remaining
                        .as_ref()
                        .map(|m| LastMessagePayload::of(&payload_from(m))),
                    last_activity,
                })
                .await;
        }

        Ok(())
    }

    /// Idempotent: emits a read receipt only when at least one message
    /// actually transitioned to read.
    pub async fn mark_read(&self, chat_id: ChatId, reader: UserId) -> Result<u32, ApiError> {
        self.ensure_membership(chat_id, reader).await?;

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let count = self
            .storage
            .mark_chat_read(chat_id, reader)
            .await
            .map_err(persistence)?;
        if count > 0 {
            info!(
                chat_id = chat_id.0,
                reader = reader.0,
                count,
                "dispatch: chat marked read"
            );
            self.broadcast_room(
                chat_id,
                ServerEvent::ReadReceipt {
                    chat_id,
                    user_id: reader,
                    count,
                },
            )
            .await;
        }
        Ok(count)
    }

    /// Creates a chat with its first message in one operation, the target the
    /// client's pending-chat promotion resolves against.
    pub async fn create_chat(
        &self,
        creator: UserId,
        peer: UserId,
        name: Option<&str>,
        body: &MessageBody,
        client_tag: Option<&str>,
    ) -> Result<(ChatPayload, MessagePayload), ApiError> {
        if body.is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "first message needs text or at least one attachment",
            ));
        }
        if creator == peer {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "a chat needs two distinct participants",
            ));
        }

        let chat_id = self
            .storage
            .create_chat(name, &[creator, peer])
            .await
            .map_err(persistence)?;
        let stored = self
            .storage
            .insert_message(chat_id, creator, body, MessageKind::Ordinary, client_tag)
            .await
            .map_err(persistence)?;
        let message = payload_from(&stored);
        info!(chat_id = chat_id.0, creator = creator.0, peer = peer.0, "dispatch: chat created");

        // Participants learn about the new chat on all of their sessions even
        // though none of them can be subscribed to the room yet.
        for user in [creator, peer] {
            let chat = self
                .chat_payload_for(chat_id, user)
                .await?
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "chat not found"))?;
            for session_id in self.sessions.sessions_for(user).await {
                self.sessions
                    .send_to(session_id, ServerEvent::ChatCreated { chat: chat.clone() })
                    .await;
            }
        }
        self.sessions
            .broadcast_all(&ServerEvent::ChatSummaryChanged {
                chat_id,
                last_message: Some(LastMessagePayload::of(&message)),
                last_activity: message.created_at,
            })
            .await;

        let chat = self
            .chat_payload_for(chat_id, creator)
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "chat not found"))?;
        Ok((chat, message))
    }

    pub async fn chat_payload_for(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<ChatPayload>, ApiError> {
        let overview = self
            .storage
            .chat_overview(chat_id, user_id)
            .await
            .map_err(persistence)?;
        Ok(overview.map(overview_to_payload))
    }

    async fn load_owned_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        author_id: UserId,
    ) -> Result<StoredMessage, ApiError> {
        let message = self
            .storage
            .load_message(message_id)
            .await
            .map_err(persistence)?
            .filter(|m| m.chat_id == chat_id)
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
        if message.author_id != author_id {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "only the author may modify a message",
            ));
        }
        Ok(message)
    }

    async fn is_current_last(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<bool, ApiError> {
        let last = self.storage.last_message(chat_id).await.map_err(persistence)?;
        Ok(last.map(|m| m.message_id) == Some(message_id))
    }
}

pub fn payload_from(stored: &StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        chat_id: stored.chat_id,
        author_id: stored.author_id,
        body: stored.body.clone(),
        kind: stored.kind,
        edited: stored.edited,
        readers: stored.readers.clone(),
        client_tag: stored.client_tag.clone(),
        created_at: stored.created_at,
        updated_at: stored.updated_at,
    }
}

pub fn overview_to_payload(overview: ChatOverview) -> ChatPayload {
    ChatPayload {
        chat_id: overview.chat_id,
        name: overview.name,
        member_ids: overview.member_ids,
        last_message: overview
            .last_message
            .as_ref()
            .map(|m| LastMessagePayload::of(&payload_from(m))),
        last_activity: overview.last_activity,
        unread: overview.unread,
    }
}

fn persistence(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Persistence, err.to_string())
}
