use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, UserId},
    protocol::{ChatPayload, LastMessagePayload, MessageBody, MessagePayload, ServerEvent},
};
use tracing::debug;

/// Identifies a chat in the local store. Preview chats exist only locally,
/// before the server has assigned a real chat id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKey {
    Real(ChatId),
    Preview(u64),
}

impl ChatKey {
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::Real(chat_id) => Some(*chat_id),
            Self::Preview(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    InFlight,
    Failed,
}

/// An optimistic message that has not been acknowledged by the server yet.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub client_tag: String,
    pub author_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub state: PendingState,
}

#[derive(Debug, Clone)]
pub enum MessageEntry {
    Confirmed(MessagePayload),
    Pending(PendingMessage),
}

impl MessageEntry {
    pub fn body(&self) -> &MessageBody {
        match self {
            Self::Confirmed(message) => &message.body,
            Self::Pending(pending) => &pending.body,
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Confirmed(message) => message.created_at,
            Self::Pending(pending) => pending.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub key: ChatKey,
    pub name: Option<String>,
    pub member_ids: Vec<UserId>,
    /// Confirmed messages ascending by (created_at, message_id); pending
    /// messages interleaved by local creation time.
    pub messages: Vec<MessageEntry>,
    pub last_message: Option<LastMessagePayload>,
    pub last_activity: DateTime<Utc>,
    pub unread: u32,
}

impl ChatEntry {
    fn skeleton(key: ChatKey, last_activity: DateTime<Utc>) -> Self {
        Self {
            key,
            name: None,
            member_ids: Vec::new(),
            messages: Vec::new(),
            last_message: None,
            last_activity,
            unread: 0,
        }
    }

    fn contains_message(&self, message_id: shared::domain::MessageId) -> bool {
        self.messages.iter().any(|entry| {
            matches!(entry, MessageEntry::Confirmed(m) if m.message_id == message_id)
        })
    }

    fn insert_confirmed(&mut self, message: MessagePayload) {
        let position = self
            .messages
            .iter()
            .position(|entry| match entry {
                MessageEntry::Confirmed(existing) => {
                    (existing.created_at, existing.message_id)
                        > (message.created_at, message.message_id)
                }
                MessageEntry::Pending(pending) => pending.created_at > message.created_at,
            })
            .unwrap_or(self.messages.len());
        self.messages.insert(position, MessageEntry::Confirmed(message));
    }

    fn take_pending(&mut self, client_tag: &str) -> Option<PendingMessage> {
        let position = self.messages.iter().position(|entry| {
            matches!(entry, MessageEntry::Pending(p) if p.client_tag == client_tag)
        })?;
        match self.messages.remove(position) {
            MessageEntry::Pending(pending) => Some(pending),
            MessageEntry::Confirmed(_) => unreachable!("position matched a pending entry"),
        }
    }

    fn apply_summary(&mut self, message: &MessagePayload) {
        if message.created_at >= self.last_activity || self.last_message.is_none() {
            self.last_message = Some(LastMessagePayload::of(message));
        }
        if message.created_at > self.last_activity {
            self.last_activity = message.created_at;
        }
    }

    /// Rebuilds the last-message summary from messages held locally, e.g.
    /// after the current last message was deleted. The authoritative summary
    /// arrives separately from the server; this keeps the UI coherent until
    /// it does.
    fn recompute_last(&mut self) {
        self.last_message = self.messages.iter().rev().find_map(|entry| match entry {
            MessageEntry::Confirmed(message) => Some(LastMessagePayload::of(message)),
            MessageEntry::Pending(_) => None,
        });
        if let Some(last) = &self.last_message {
            self.last_activity = last.sent_at;
        }
    }

    /// Ordering key for the chat list. An unacknowledged outgoing message
    /// keeps its chat at the top even before the server confirms it.
    pub fn effective_activity(&self) -> DateTime<Utc> {
        self.messages
            .iter()
            .rev()
            .find_map(|entry| match entry {
                MessageEntry::Pending(pending) => Some(pending.created_at),
                MessageEntry::Confirmed(_) => None,
            })
            .map_or(self.last_activity, |pending_at| {
                pending_at.max(self.last_activity)
            })
    }

    /// One-line preview for the chat list, preferring the newest pending
    /// message over the confirmed summary when it is more recent.
    pub fn preview(&self) -> Option<String> {
        let newest_pending = self.messages.iter().rev().find_map(|entry| match entry {
            MessageEntry::Pending(pending) => Some(pending),
            MessageEntry::Confirmed(_) => None,
        });
        match (newest_pending, &self.last_message) {
            (Some(pending), Some(last)) if pending.created_at > last.sent_at => {
                Some(pending.body.preview())
            }
            (Some(pending), None) => Some(pending.body.preview()),
            (_, Some(last)) => Some(last.preview.clone()),
            (None, None) => None,
        }
    }
}

/// Client-side source of truth for chats and messages. Purely synchronous;
/// the facade serializes access behind its own mutex.
#[derive(Debug)]
pub struct ReconciliationStore {
    self_user_id: UserId,
    chats: HashMap<ChatKey, ChatEntry>,
    focused: Option<ChatKey>,
    next_preview: u64,
}

impl ReconciliationStore {
    pub fn new(self_user_id: UserId) -> Self {
        Self {
            self_user_id,
            chats: HashMap::new(),
            focused: None,
            next_preview: 0,
        }
    }

    pub fn self_user_id(&self) -> UserId {
        self.self_user_id
    }

    pub fn focused(&self) -> Option<ChatKey> {
        self.focused
    }

    fn entry_or_skeleton(&mut self, chat_id: ChatId, seen_at: DateTime<Utc>) -> &mut ChatEntry {
        let key = ChatKey::Real(chat_id);
        self.chats
            .entry(key)
            .or_insert_with(|| ChatEntry::skeleton(key, seen_at))
    }

    /// Applies one server event. Safe to call with duplicates and with events
    /// arriving out of order; id-based suppression and last-write-wins keep
    /// the result consistent.
    pub fn apply_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageCreated { chat_id, message } => {
                self.apply_message_created(*chat_id, message);
            }
            ServerEvent::MessageUpdated {
                chat_id, message_id, message,
            } => {
                if let Some(entry) = self.chats.get_mut(&ChatKey::Real(*chat_id)) {
                    let mut replaced = false;
                    for slot in entry.messages.iter_mut() {
                        if let MessageEntry::Confirmed(existing) = slot {
                            if existing.message_id == *message_id {
                                *existing = message.clone();
                                replaced = true;
                                break;
                            }
                        }
                    }
                    if replaced {
                        if entry
                            .last_message
                            .as_ref()
                            .is_some_and(|last| last.message_id == *message_id)
                        {
                            entry.last_message = Some(LastMessagePayload::of(message));
                        }
                    }
                }
            }
            ServerEvent::MessageDeleted { chat_id, message_id } => {
                if let Some(entry) = self.chats.get_mut(&ChatKey::Real(*chat_id)) {
                    entry.messages.retain(|slot| {
                        !matches!(slot, MessageEntry::Confirmed(m) if m.message_id == *message_id)
                    });
                    if entry
                        .last_message
                        .as_ref()
                        .is_some_and(|last| last.message_id == *message_id)
                    {
                        entry.recompute_last();
                    }
                }
            }
            ServerEvent::ChatSummaryChanged {
                chat_id,
                last_message,
                last_activity,
            } => {
                let focused_here = self.focused == Some(ChatKey::Real(*chat_id));
                let self_user_id = self.self_user_id;
                let entry = self.entry_or_skeleton(*chat_id, *last_activity);
                // For chats this session is not subscribed to, the summary is
                // the only signal a message landed. A foreign last message with
                // an id we have not seen counts as unread; the id check keeps
                // replays and post-broadcast summaries from double counting.
                if let Some(incoming) = last_message {
                    let already_seen = entry.contains_message(incoming.message_id)
                        || entry
                            .last_message
                            .as_ref()
                            .is_some_and(|last| last.message_id == incoming.message_id);
                    if !already_seen && incoming.author_id != self_user_id && !focused_here {
                        entry.unread += 1;
                    }
                }
                entry.last_message = last_message.clone();
                entry.last_activity = *last_activity;
            }
            ServerEvent::ReadReceipt { chat_id, user_id, .. } => {
                if let Some(entry) = self.chats.get_mut(&ChatKey::Real(*chat_id)) {
                    if *user_id == self.self_user_id {
                        entry.unread = 0;
                    }
                    for slot in entry.messages.iter_mut() {
                        if let MessageEntry::Confirmed(message) = slot {
                            if !message.readers.contains(user_id) {
                                message.readers.push(*user_id);
                            }
                        }
                    }
                }
            }
            ServerEvent::ChatCreated { chat } => self.apply_chat_created(chat),
            ServerEvent::ChatUpdated { chat } => {
                let entry = self.entry_or_skeleton(chat.chat_id, chat.last_activity);
                entry.name = chat.name.clone();
                entry.member_ids = chat.member_ids.clone();
                entry.last_message = chat.last_message.clone();
                entry.last_activity = chat.last_activity;
                entry.unread = entry.unread.max(chat.unread);
            }
            ServerEvent::ChatDeleted { chat_id } => {
                let key = ChatKey::Real(*chat_id);
                self.chats.remove(&key);
                if self.focused == Some(key) {
                    self.focused = None;
                }
            }
            ServerEvent::Error(_) => {}
        }
    }

    fn apply_message_created(&mut self, chat_id: ChatId, message: &MessagePayload) {
        // An echo of our own optimistic send confirms the pending entry
        // instead of appearing as a new message.
        if message.author_id == self.self_user_id {
            if let Some(tag) = message.client_tag.as_deref() {
                if self.take_pending_anywhere(tag).is_some() {
                    debug!(tag, "store: echo confirmed pending message");
                    let entry = self.entry_or_skeleton(chat_id, message.created_at);
                    if !entry.contains_message(message.message_id) {
                        entry.insert_confirmed(message.clone());
                    }
                    entry.apply_summary(message);
                    return;
                }
            }
        }

        let key = ChatKey::Real(chat_id);
        let focused_here = self.focused == Some(key);
        let self_user_id = self.self_user_id;
        let entry = self.entry_or_skeleton(chat_id, message.created_at);
        if entry.contains_message(message.message_id) {
            return;
        }
        entry.insert_confirmed(message.clone());
        entry.apply_summary(message);
        if message.author_id != self_user_id && !focused_here {
            entry.unread += 1;
        }
    }

    fn apply_chat_created(&mut self, chat: &ChatPayload) {
        // A new chat announced by the server may be one of our own preview
        // chats coming back confirmed. Match on the member set.
        let preview_key = self.chats.iter().find_map(|(key, entry)| {
            match key {
                ChatKey::Preview(_) if same_members(&entry.member_ids, &chat.member_ids) => {
                    Some(*key)
                }
                _ => None,
            }
        });
        let real_key = ChatKey::Real(chat.chat_id);

        if let Some(preview_key) = preview_key {
            let preview = self
                .chats
                .remove(&preview_key)
                .unwrap_or_else(|| ChatEntry::skeleton(preview_key, chat.last_activity));
            let entry = self
                .chats
                .entry(real_key)
                .or_insert_with(|| ChatEntry::skeleton(real_key, chat.last_activity));
            entry.messages.extend(preview.messages);
            entry.unread = entry.unread.max(preview.unread);
            if self.focused == Some(preview_key) {
                self.focused = Some(real_key);
            }
        }

        let entry = self
            .chats
            .entry(real_key)
            .or_insert_with(|| ChatEntry::skeleton(real_key, chat.last_activity));
        entry.name = chat.name.clone();
        entry.member_ids = chat.member_ids.clone();
        entry.last_message = chat.last_message.clone();
        entry.last_activity = chat.last_activity;
        entry.unread = entry.unread.max(chat.unread);
    }

    fn take_pending_anywhere(&mut self, client_tag: &str) -> Option<PendingMessage> {
        let key = *self.chats.iter().find(|(_, entry)| {
            entry.messages.iter().any(|slot| {
                matches!(slot, MessageEntry::Pending(p) if p.client_tag == client_tag)
            })
        })?.0;
        self.chats.get_mut(&key)?.take_pending(client_tag)
    }

    /// Appends an optimistic message and returns the correlation tag the
    /// server will echo back.
    pub fn begin_send(&mut self, key: ChatKey, body: MessageBody) -> Option<String> {
        let entry = self.chats.get_mut(&key)?;
        let client_tag = uuid::Uuid::new_v4().to_string();
        entry.messages.push(MessageEntry::Pending(PendingMessage {
            client_tag: client_tag.clone(),
            author_id: self.self_user_id,
            body,
            created_at: Utc::now(),
            state: PendingState::InFlight,
        }));
        Some(client_tag)
    }

    /// Replaces the pending entry carrying `client_tag` with the confirmed
    /// message. Matching is by tag only; a failed entry is still promoted if
    /// the confirmation arrives late.
    pub fn confirm_send(&mut self, client_tag: &str, message: &MessagePayload) {
        self.take_pending_anywhere(client_tag);
        let entry = self.entry_or_skeleton(message.chat_id, message.created_at);
        if !entry.contains_message(message.message_id) {
            entry.insert_confirmed(message.clone());
        }
        entry.apply_summary(message);
    }

    /// Marks the pending entry failed in place. The message stays visible so
    /// the user can retry or discard it.
    pub fn fail_send(&mut self, client_tag: &str) {
        for entry in self.chats.values_mut() {
            for slot in entry.messages.iter_mut() {
                if let MessageEntry::Pending(pending) = slot {
                    if pending.client_tag == client_tag {
                        pending.state = PendingState::Failed;
                        return;
                    }
                }
            }
        }
    }

    /// Opens a local-only chat with `peer` that has no server id yet.
    pub fn open_preview(&mut self, peer: UserId) -> ChatKey {
        self.next_preview += 1;
        let key = ChatKey::Preview(self.next_preview);
        let mut entry = ChatEntry::skeleton(key, Utc::now());
        entry.member_ids = vec![self.self_user_id, peer];
        self.chats.insert(key, entry);
        key
    }

    /// Swaps a preview chat for the real one the server created from it.
    /// Focus follows the swap; remaining pending messages move over.
    pub fn promote_preview(
        &mut self,
        key: ChatKey,
        chat: &ChatPayload,
        first_message: &MessagePayload,
    ) {
        let preview = self.chats.remove(&key);
        let real_key = ChatKey::Real(chat.chat_id);
        let entry = self
            .chats
            .entry(real_key)
            .or_insert_with(|| ChatEntry::skeleton(real_key, chat.last_activity));
        entry.name = chat.name.clone();
        entry.member_ids = chat.member_ids.clone();
        entry.last_activity = chat.last_activity;
        entry.last_message = chat.last_message.clone();

        if let Some(preview) = preview {
            for slot in preview.messages {
                match slot {
                    MessageEntry::Pending(pending)
                        if first_message.client_tag.as_deref()
                            == Some(pending.client_tag.as_str()) => {}
                    other => entry.messages.push(other),
                }
            }
        }
        if !entry.contains_message(first_message.message_id) {
            entry.insert_confirmed(first_message.clone());
        }
        entry.apply_summary(first_message);
        if self.focused == Some(key) {
            self.focused = Some(real_key);
        }
    }

    /// Changes the focused chat. Focusing a chat acknowledges everything in
    /// it, so its unread counter resets.
    pub fn focus(&mut self, key: Option<ChatKey>) {
        self.focused = key;
        if let Some(entry) = key.and_then(|key| self.chats.get_mut(&key)) {
            entry.unread = 0;
        }
    }

    /// Replaces the chat list with the server's authoritative snapshot.
    /// Preview chats, pending messages, and locally-known unread counts the
    /// server has not caught up with survive the merge.
    pub fn resync(&mut self, chats: Vec<ChatPayload>) {
        let mut merged: HashMap<ChatKey, ChatEntry> = HashMap::new();

        for chat in chats {
            let key = ChatKey::Real(chat.chat_id);
            let mut entry = match self.chats.remove(&key) {
                Some(mut existing) => {
                    existing.unread = existing.unread.max(chat.unread);
                    existing
                }
                None => {
                    let mut fresh = ChatEntry::skeleton(key, chat.last_activity);
                    fresh.unread = chat.unread;
                    fresh
                }
            };
            entry.name = chat.name;
            entry.member_ids = chat.member_ids;
            entry.last_message = chat.last_message;
            entry.last_activity = chat.last_activity;
            merged.insert(key, entry);
        }

        // Previews never came from the server; chats the server dropped are
        // gone, but their unsent messages would be lost with them, so any
        // real chat still holding pendings is kept until they settle.
        for (key, entry) in self.chats.drain() {
            let has_pending = entry
                .messages
                .iter()
                .any(|slot| matches!(slot, MessageEntry::Pending(_)));
            if matches!(key, ChatKey::Preview(_)) || has_pending {
                merged.entry(key).or_insert(entry);
            } else if self.focused == Some(key) {
                self.focused = None;
            }
        }

        self.chats = merged;
        if let Some(focused) = self.focused {
            if !self.chats.contains_key(&focused) {
                self.focused = None;
            }
        }
    }

    /// Inserts a page of history fetched over REST. Never touches unread:
    /// paging backwards is not receiving new messages.
    pub fn merge_history(&mut self, key: ChatKey, messages: &[MessagePayload]) {
        let Some(entry) = self.chats.get_mut(&key) else {
            return;
        };
        for message in messages {
            if !entry.contains_message(message.message_id) {
                entry.insert_confirmed(message.clone());
            }
        }
    }

    /// Chats ordered by descending activity, unsent messages included.
    pub fn chat_list(&self) -> Vec<&ChatEntry> {
        let mut list: Vec<&ChatEntry> = self.chats.values().collect();
        list.sort_by(|a, b| b.effective_activity().cmp(&a.effective_activity()));
        list
    }

    pub fn messages(&self, key: ChatKey) -> Option<&[MessageEntry]> {
        self.chats.get(&key).map(|entry| entry.messages.as_slice())
    }

    pub fn chat(&self, key: ChatKey) -> Option<&ChatEntry> {
        self.chats.get(&key)
    }

    pub fn unread(&self, key: ChatKey) -> u32 {
        self.chats.get(&key).map_or(0, |entry| entry.unread)
    }

    /// Real chat ids the connection should subscribe to.
    pub fn active_rooms(&self) -> Vec<ChatId> {
        let mut rooms: Vec<ChatId> = self
            .chats
            .keys()
            .filter_map(ChatKey::chat_id)
            .collect();
        rooms.sort();
        rooms
    }
}

fn same_members(a: &[UserId], b: &[UserId]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort();
    b_sorted.sort();
    a_sorted == b_sorted
}
