use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    protocol::{ChatPayload, LastMessagePayload, MessageBody, MessagePayload, ServerEvent},
};

use crate::store::{ChatKey, MessageEntry, PendingState, ReconciliationStore};

const SELF: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn message(id: i64, chat: i64, author: UserId, text: &str, secs: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        chat_id: ChatId(chat),
        author_id: author,
        body: MessageBody::text(text),
        kind: MessageKind::Ordinary,
        edited: false,
        readers: vec![author],
        client_tag: None,
        created_at: at(secs),
        updated_at: at(secs),
    }
}

fn created(message: &MessagePayload) -> ServerEvent {
    ServerEvent::MessageCreated {
        chat_id: message.chat_id,
        message: message.clone(),
    }
}

fn chat_payload(chat: i64, last: Option<&MessagePayload>, unread: u32) -> ChatPayload {
    ChatPayload {
        chat_id: ChatId(chat),
        name: None,
        member_ids: vec![SELF, PEER],
        last_message: last.map(LastMessagePayload::of),
        last_activity: last.map_or(at(0), |m| m.created_at),
        unread,
    }
}

fn confirmed_ids(store: &ReconciliationStore, key: ChatKey) -> Vec<i64> {
    store
        .messages(key)
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| match entry {
            MessageEntry::Confirmed(m) => Some(m.message_id.0),
            MessageEntry::Pending(_) => None,
        })
        .collect()
}

fn pending_states(store: &ReconciliationStore, key: ChatKey) -> Vec<PendingState> {
    store
        .messages(key)
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| match entry {
            MessageEntry::Pending(p) => Some(p.state),
            MessageEntry::Confirmed(_) => None,
        })
        .collect()
}

#[test]
fn duplicate_delivery_is_applied_once() {
    let mut store = ReconciliationStore::new(SELF);
    let m = message(10, 1, PEER, "hi", 1);
    store.apply_event(&created(&m));
    store.apply_event(&created(&m));

    let key = ChatKey::Real(ChatId(1));
    assert_eq!(confirmed_ids(&store, key), vec![10]);
    assert_eq!(store.unread(key), 1);
}

#[test]
fn unread_counts_only_foreign_messages_on_unfocused_chats() {
    let mut store = ReconciliationStore::new(SELF);
    let key = ChatKey::Real(ChatId(1));

    store.apply_event(&created(&message(10, 1, PEER, "a", 1)));
    store.apply_event(&created(&message(11, 1, SELF, "b", 2)));
    assert_eq!(store.unread(key), 1);

    store.focus(Some(key));
    assert_eq!(store.unread(key), 0);
    store.apply_event(&created(&message(12, 1, PEER, "c", 3)));
    assert_eq!(store.unread(key), 0);

    store.focus(None);
    store.apply_event(&created(&message(13, 1, PEER, "d", 4)));
    assert_eq!(store.unread(key), 1);
}

#[test]
fn echo_with_own_client_tag_confirms_instead_of_duplicating() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "hi", 1)));
    let key = ChatKey::Real(ChatId(1));

    let tag = store.begin_send(key, MessageBody::text("reply")).unwrap();
    let mut echoed = message(11, 1, SELF, "reply", 2);
    echoed.client_tag = Some(tag);
    store.apply_event(&created(&echoed));

    assert_eq!(confirmed_ids(&store, key), vec![10, 11]);
    assert!(pending_states(&store, key).is_empty());
    assert_eq!(store.unread(key), 1);
}

#[test]
fn confirm_send_replaces_pending_by_tag_even_after_failure() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "hi", 1)));
    let key = ChatKey::Real(ChatId(1));

    let tag = store.begin_send(key, MessageBody::text("slow")).unwrap();
    store.fail_send(&tag);
    assert_eq!(pending_states(&store, key), vec![PendingState::Failed]);

    let mut confirmed = message(11, 1, SELF, "slow", 2);
    confirmed.client_tag = Some(tag.clone());
    store.confirm_send(&tag, &confirmed);

    assert_eq!(confirmed_ids(&store, key), vec![10, 11]);
    assert!(pending_states(&store, key).is_empty());
}

#[test]
fn failed_send_stays_visible_and_keeps_chat_on_top() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "old", 1)));
    store.apply_event(&created(&message(20, 2, PEER, "newer", 100)));

    let key = ChatKey::Real(ChatId(1));
    let tag = store.begin_send(key, MessageBody::text("unsent")).unwrap();
    store.fail_send(&tag);

    assert_eq!(pending_states(&store, key), vec![PendingState::Failed]);
    let list = store.chat_list();
    assert_eq!(list[0].key, key);
    assert_eq!(list[0].preview().as_deref(), Some("unsent"));
}

#[test]
fn out_of_order_delivery_sorts_by_creation_time() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(12, 1, PEER, "third", 3)));
    store.apply_event(&created(&message(10, 1, PEER, "first", 1)));
    store.apply_event(&created(&message(11, 1, PEER, "second", 2)));

    let key = ChatKey::Real(ChatId(1));
    assert_eq!(confirmed_ids(&store, key), vec![10, 11, 12]);
    let bodies: Vec<String> = store
        .messages(key)
        .unwrap()
        .iter()
        .map(|entry| entry.body().preview())
        .collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);
}

#[test]
fn edit_refreshes_preview_without_reordering() {
    let mut store = ReconciliationStore::new(SELF);
    let last = message(11, 1, PEER, "last", 2);
    store.apply_event(&created(&message(10, 1, PEER, "first", 1)));
    store.apply_event(&created(&last));
    let key = ChatKey::Real(ChatId(1));
    let activity_before = store.chat(key).unwrap().effective_activity();

    let mut edited = last.clone();
    edited.body = MessageBody::text("last (edited)");
    edited.edited = true;
    store.apply_event(&ServerEvent::MessageUpdated {
        chat_id: ChatId(1),
        message_id: MessageId(11),
        message: edited,
    });

    let entry = store.chat(key).unwrap();
    assert_eq!(entry.preview().as_deref(), Some("last (edited)"));
    assert_eq!(entry.effective_activity(), activity_before);

    // Editing a non-last message leaves the preview alone.
    let mut older = message(10, 1, PEER, "first!", 1);
    older.edited = true;
    store.apply_event(&ServerEvent::MessageUpdated {
        chat_id: ChatId(1),
        message_id: MessageId(10),
        message: older,
    });
    assert_eq!(store.chat(key).unwrap().preview().as_deref(), Some("last (edited)"));
}

#[test]
fn deleting_the_last_message_recomputes_the_summary_locally() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "first", 1)));
    store.apply_event(&created(&message(11, 1, PEER, "second", 2)));

    store.apply_event(&ServerEvent::MessageDeleted {
        chat_id: ChatId(1),
        message_id: MessageId(11),
    });

    let entry = store.chat(ChatKey::Real(ChatId(1))).unwrap();
    assert_eq!(entry.last_message.as_ref().unwrap().message_id, MessageId(10));
    assert_eq!(entry.preview().as_deref(), Some("first"));
}

#[test]
fn own_read_receipt_clears_unread_and_foreign_one_marks_readers() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "hi", 1)));
    let key = ChatKey::Real(ChatId(1));
    assert_eq!(store.unread(key), 1);

    store.apply_event(&ServerEvent::ReadReceipt {
        chat_id: ChatId(1),
        user_id: SELF,
        count: 1,
    });
    assert_eq!(store.unread(key), 0);

    store.apply_event(&created(&message(11, 1, SELF, "mine", 2)));
    store.apply_event(&ServerEvent::ReadReceipt {
        chat_id: ChatId(1),
        user_id: PEER,
        count: 1,
    });
    let messages = store.messages(key).unwrap();
    let MessageEntry::Confirmed(mine) = &messages[1] else {
        panic!("expected confirmed message");
    };
    assert!(mine.readers.contains(&PEER));
}

#[test]
fn summary_event_creates_a_skeleton_entry_and_is_idempotent() {
    let mut store = ReconciliationStore::new(SELF);
    let last = message(10, 5, PEER, "elsewhere", 7);
    let event = ServerEvent::ChatSummaryChanged {
        chat_id: ChatId(5),
        last_message: Some(LastMessagePayload::of(&last)),
        last_activity: last.created_at,
    };
    store.apply_event(&event);
    store.apply_event(&event);

    let key = ChatKey::Real(ChatId(5));
    let entry = store.chat(key).unwrap();
    assert_eq!(entry.preview().as_deref(), Some("elsewhere"));
    assert_eq!(entry.last_activity, at(7));
    // A foreign last message counts once, however often the summary replays.
    assert_eq!(store.unread(key), 1);
}

#[test]
fn summary_events_track_unread_for_unsubscribed_chats() {
    let mut store = ReconciliationStore::new(SELF);
    for id in 10..13 {
        let last = message(id, 5, PEER, "busy chat", id);
        store.apply_event(&ServerEvent::ChatSummaryChanged {
            chat_id: ChatId(5),
            last_message: Some(LastMessagePayload::of(&last)),
            last_activity: last.created_at,
        });
    }
    assert_eq!(store.unread(ChatKey::Real(ChatId(5))), 3);

    // Our own message elsewhere never counts.
    let mine = message(20, 6, SELF, "from another session", 1);
    store.apply_event(&ServerEvent::ChatSummaryChanged {
        chat_id: ChatId(6),
        last_message: Some(LastMessagePayload::of(&mine)),
        last_activity: mine.created_at,
    });
    assert_eq!(store.unread(ChatKey::Real(ChatId(6))), 0);
}

#[test]
fn summary_after_message_created_does_not_double_count() {
    let mut store = ReconciliationStore::new(SELF);
    let msg = message(10, 1, PEER, "hi", 1);
    store.apply_event(&created(&msg));
    store.apply_event(&ServerEvent::ChatSummaryChanged {
        chat_id: ChatId(1),
        last_message: Some(LastMessagePayload::of(&msg)),
        last_activity: msg.created_at,
    });
    assert_eq!(store.unread(ChatKey::Real(ChatId(1))), 1);
}

#[test]
fn chat_created_adopts_a_matching_preview() {
    let mut store = ReconciliationStore::new(SELF);
    let preview = store.open_preview(PEER);
    store.focus(Some(preview));
    let tag = store.begin_send(preview, MessageBody::text("first")).unwrap();

    store.apply_event(&ServerEvent::ChatCreated {
        chat: chat_payload(3, None, 0),
    });

    let real = ChatKey::Real(ChatId(3));
    assert!(store.chat(preview).is_none());
    assert_eq!(store.focused(), Some(real));
    // The pending first message moved over and still reconciles by tag.
    let mut confirmed = message(30, 3, SELF, "first", 1);
    confirmed.client_tag = Some(tag.clone());
    store.confirm_send(&tag, &confirmed);
    assert_eq!(confirmed_ids(&store, real), vec![30]);
    assert!(pending_states(&store, real).is_empty());
}

#[test]
fn promote_preview_swaps_in_the_real_chat() {
    let mut store = ReconciliationStore::new(SELF);
    let preview = store.open_preview(PEER);
    store.focus(Some(preview));
    let tag = store.begin_send(preview, MessageBody::text("first")).unwrap();

    let mut first = message(30, 3, SELF, "first", 1);
    first.client_tag = Some(tag);
    store.promote_preview(preview, &chat_payload(3, Some(&first), 0), &first);

    let real = ChatKey::Real(ChatId(3));
    assert!(store.chat(preview).is_none());
    assert_eq!(store.focused(), Some(real));
    assert_eq!(confirmed_ids(&store, real), vec![30]);
    assert!(pending_states(&store, real).is_empty());
    assert_eq!(store.active_rooms(), vec![ChatId(3)]);
}

#[test]
fn failed_chat_creation_keeps_the_preview_and_its_message() {
    let mut store = ReconciliationStore::new(SELF);
    let preview = store.open_preview(PEER);
    let tag = store.begin_send(preview, MessageBody::text("first")).unwrap();
    store.fail_send(&tag);

    assert_eq!(pending_states(&store, preview), vec![PendingState::Failed]);
    assert_eq!(store.chat(preview).unwrap().preview().as_deref(), Some("first"));
    assert!(store.active_rooms().is_empty());
}

#[test]
fn resync_preserves_previews_pendings_and_local_unread() {
    let mut store = ReconciliationStore::new(SELF);
    let m1 = message(10, 1, PEER, "one", 1);
    store.apply_event(&created(&m1));
    store.apply_event(&created(&message(11, 1, PEER, "two", 2)));
    let preview = store.open_preview(UserId(9));
    store.begin_send(preview, MessageBody::text("draft")).unwrap();

    // Server snapshot is behind on unread for chat 1 and does not know the
    // preview; it also brings a chat we have never seen.
    store.resync(vec![chat_payload(1, Some(&m1), 1), chat_payload(4, None, 3)]);

    assert_eq!(store.unread(ChatKey::Real(ChatId(1))), 2);
    assert_eq!(store.unread(ChatKey::Real(ChatId(4))), 3);
    assert!(store.chat(preview).is_some());
    assert_eq!(confirmed_ids(&store, ChatKey::Real(ChatId(1))), vec![10, 11]);
}

#[test]
fn resync_drops_chats_the_server_no_longer_lists() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "gone", 1)));
    store.focus(Some(ChatKey::Real(ChatId(1))));

    store.resync(Vec::new());

    assert!(store.chat(ChatKey::Real(ChatId(1))).is_none());
    assert_eq!(store.focused(), None);
}

#[test]
fn chat_deleted_clears_focus() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "hi", 1)));
    let key = ChatKey::Real(ChatId(1));
    store.focus(Some(key));

    store.apply_event(&ServerEvent::ChatDeleted { chat_id: ChatId(1) });

    assert!(store.chat(key).is_none());
    assert_eq!(store.focused(), None);
}

#[test]
fn merge_history_never_bumps_unread() {
    let mut store = ReconciliationStore::new(SELF);
    let latest = message(20, 1, PEER, "latest", 20);
    store.apply_event(&created(&latest));
    let key = ChatKey::Real(ChatId(1));
    assert_eq!(store.unread(key), 1);

    store.merge_history(
        key,
        &[message(10, 1, PEER, "old", 1), message(11, 1, PEER, "older page", 2)],
    );

    assert_eq!(confirmed_ids(&store, key), vec![10, 11, 20]);
    assert_eq!(store.unread(key), 1);
}

#[test]
fn chat_list_orders_by_most_recent_activity() {
    let mut store = ReconciliationStore::new(SELF);
    store.apply_event(&created(&message(10, 1, PEER, "a", 10)));
    store.apply_event(&created(&message(20, 2, PEER, "b", 20)));
    store.apply_event(&created(&message(30, 3, PEER, "c", 5)));

    let keys: Vec<ChatKey> = store.chat_list().iter().map(|entry| entry.key).collect();
    assert_eq!(
        keys,
        vec![
            ChatKey::Real(ChatId(2)),
            ChatKey::Real(ChatId(1)),
            ChatKey::Real(ChatId(3)),
        ]
    );
}
