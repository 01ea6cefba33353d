use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentPayload {
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Text and/or an ordered list of attachments. A body is sendable only if it
/// carries non-blank text or at least one attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.attachments.is_empty()
    }

    /// One-line rendering used for chat-list summaries.
    pub fn preview(&self) -> String {
        if let Some(text) = self.text.as_deref() {
            let text = text.trim();
            if !text.is_empty() {
                return text.to_string();
            }
        }
        match self.attachments.first() {
            Some(attachment) => format!("[{}]", attachment.filename),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub body: MessageBody,
    pub kind: MessageKind,
    pub edited: bool,
    /// User ids that have read this message; always contains the author.
    pub readers: Vec<UserId>,
    /// Client-generated correlation id, echoed back verbatim so the origin
    /// client can match the broadcast against its optimistic copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessagePayload {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub preview: String,
    pub edited: bool,
    pub sent_at: DateTime<Utc>,
}

impl LastMessagePayload {
    pub fn of(message: &MessagePayload) -> Self {
        Self {
            message_id: message.message_id,
            author_id: message.author_id,
            preview: message.body.preview(),
            edited: message.edited,
            sent_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub member_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    pub last_activity: DateTime<Utc>,
    /// Unread count for the requesting user; zero on broadcast copies.
    #[serde(default)]
    pub unread: u32,
}

/// Control messages sent by a client over an established connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientControl {
    SubscribeRoom { chat_id: ChatId },
    UnsubscribeRoom { chat_id: ChatId },
    /// At most one chat per session is focused for read-receipt purposes.
    FocusRoom { chat_id: Option<ChatId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        chat_id: ChatId,
        message: MessagePayload,
    },
    MessageUpdated {
        chat_id: ChatId,
        message_id: MessageId,
        message: MessagePayload,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    ChatSummaryChanged {
        chat_id: ChatId,
        last_message: Option<LastMessagePayload>,
        last_activity: DateTime<Utc>,
    },
    ReadReceipt {
        chat_id: ChatId,
        user_id: UserId,
        count: u32,
    },
    ChatCreated {
        chat: ChatPayload,
    },
    ChatUpdated {
        chat: ChatPayload,
    },
    ChatDeleted {
        chat_id: ChatId,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_without_attachments_is_empty() {
        assert!(MessageBody::default().is_empty());
        assert!(MessageBody::text("   ").is_empty());
        assert!(!MessageBody::text("hi").is_empty());

        let attachment_only = MessageBody {
            text: None,
            attachments: vec![AttachmentPayload {
                filename: "photo.png".into(),
                size_bytes: 12,
                mime_type: None,
            }],
        };
        assert!(!attachment_only.is_empty());
        assert_eq!(attachment_only.preview(), "[photo.png]");
    }

    #[test]
    fn control_messages_round_trip_tagged() {
        let control = ClientControl::SubscribeRoom {
            chat_id: ChatId(7),
        };
        let json = serde_json::to_string(&control).expect("serialize");
        assert!(json.contains("\"type\":\"subscribe_room\""));
        let parsed: ClientControl = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, control);
    }

    #[test]
    fn server_event_carries_explicit_absent_fields() {
        let event = ServerEvent::ChatSummaryChanged {
            chat_id: ChatId(1),
            last_message: None,
            last_activity: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let parsed: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            ServerEvent::ChatSummaryChanged { last_message, .. } => {
                assert!(last_message.is_none())
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
