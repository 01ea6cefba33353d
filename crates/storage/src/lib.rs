use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::str::FromStr;

use shared::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    protocol::{AttachmentPayload, MessageBody},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub body: MessageBody,
    pub kind: MessageKind,
    pub edited: bool,
    pub readers: Vec<UserId>,
    pub client_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The ChatSummary projection for one chat as seen by one user.
#[derive(Debug, Clone)]
pub struct ChatOverview {
    pub chat_id: ChatId,
    pub name: Option<String>,
    pub member_ids: Vec<UserId>,
    pub last_message: Option<StoredMessage>,
    pub last_activity: DateTime<Utc>,
    pub unread: u32,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS users (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE
            )",
            "CREATE TABLE IF NOT EXISTS chats (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS chat_members (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id          INTEGER NOT NULL,
                author_id        INTEGER NOT NULL,
                body_text        TEXT,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                kind             TEXT NOT NULL DEFAULT 'ordinary',
                edited           INTEGER NOT NULL DEFAULT 0,
                client_tag       TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (chat_id, id)",
            "CREATE TABLE IF NOT EXISTS message_reads (
                message_id INTEGER NOT NULL,
                user_id    INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            )",
        ];
        for statement in ddl {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize schema")?;
        }
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn create_chat(&self, name: Option<&str>, members: &[UserId]) -> Result<ChatId> {
        let now = Utc::now();
        let rec = sqlx::query("INSERT INTO chats (name, created_at) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        let chat_id = ChatId(rec.get::<i64, _>(0));
        for member in members {
            sqlx::query("INSERT OR IGNORE INTO chat_members (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id.0)
                .bind(member.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(chat_id)
    }

    pub async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM chat_members WHERE chat_id = ? ORDER BY user_id")
            .bind(chat_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn chat_created_at(&self, chat_id: ChatId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT created_at FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
    }

    pub async fn insert_message(
        &self,
        chat_id: ChatId,
        author_id: UserId,
        body: &MessageBody,
        kind: MessageKind,
        client_tag: Option<&str>,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let attachments_json = serde_json::to_string(&body.attachments)?;
        let rec = sqlx::query(
            "INSERT INTO messages
                 (chat_id, author_id, body_text, attachments_json, kind, client_tag, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat_id.0)
        .bind(author_id.0)
        .bind(body.text.as_deref())
        .bind(&attachments_json)
        .bind(kind_to_str(kind))
        .bind(client_tag)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        // The reader set always includes the author.
        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(author_id.0)
            .execute(&self.pool)
            .await?;

        Ok(StoredMessage {
            message_id,
            chat_id,
            author_id,
            body: body.clone(),
            kind,
            edited: false,
            readers: vec![author_id],
            client_tag: client_tag.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, chat_id, author_id, body_text, attachments_json, kind, edited, client_tag,
                    created_at, updated_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let readers = self.message_readers(message_id).await?;
        Ok(Some(message_from_row(&row, readers)?))
    }

    pub async fn update_message_body(
        &self,
        message_id: MessageId,
        body: &MessageBody,
    ) -> Result<Option<StoredMessage>> {
        let now = Utc::now();
        let attachments_json = serde_json::to_string(&body.attachments)?;
        let result = sqlx::query(
            "UPDATE messages
             SET body_text = ?, attachments_json = ?, edited = 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(body.text.as_deref())
        .bind(&attachments_json)
        .bind(now)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.load_message(message_id).await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM message_reads WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn message_readers(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY user_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    /// Marks every message in the chat that was authored by someone else and
    /// not yet read by `reader`. Returns the number of messages affected;
    /// zero means the call was an idempotent no-op.
    pub async fn mark_chat_read(&self, chat_id: ChatId, reader: UserId) -> Result<u32> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id)
             SELECT m.id, ? FROM messages m
             WHERE m.chat_id = ? AND m.author_id != ?",
        )
        .bind(reader.0)
        .bind(chat_id.0)
        .bind(reader.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.chat_id = ? AND m.author_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?
               )",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    /// Ascending page of messages ending just before `before`; the second
    /// element reports whether older messages remain.
    pub async fn list_chat_messages(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<(Vec<StoredMessage>, bool)> {
        let limit = limit.max(1);
        let rows = match before {
            Some(cursor) => {
                sqlx::query(
                    "SELECT id, chat_id, author_id, body_text, attachments_json, kind, edited,
                            client_tag, created_at, updated_at
                     FROM messages WHERE chat_id = ? AND id < ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(chat_id.0)
                .bind(cursor.0)
                .bind(limit as i64 + 1)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, chat_id, author_id, body_text, attachments_json, kind, edited,
                            client_tag, created_at, updated_at
                     FROM messages WHERE chat_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(chat_id.0)
                .bind(limit as i64 + 1)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let has_more = rows.len() as u32 > limit;
        let mut messages = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.into_iter().take(limit as usize) {
            let message_id = MessageId(row.get::<i64, _>("id"));
            let readers = self.message_readers(message_id).await?;
            messages.push(message_from_row(&row, readers)?);
        }
        messages.reverse();
        Ok((messages, has_more))
    }

    /// Latest remaining message in the chat, if any.
    pub async fn last_message(&self, chat_id: ChatId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id FROM messages WHERE chat_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => self.load_message(MessageId(row.get::<i64, _>(0))).await,
            None => Ok(None),
        }
    }

    pub async fn chat_overview(
        &self,
        chat_id: ChatId,
        for_user: UserId,
    ) -> Result<Option<ChatOverview>> {
        let row = sqlx::query("SELECT name, created_at FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let name: Option<String> = row.get(0);
        let created_at: DateTime<Utc> = row.get(1);

        let member_ids = self.chat_members(chat_id).await?;
        let last_message = self.last_message(chat_id).await?;
        let unread = self.unread_count(chat_id, for_user).await?;
        let last_activity = last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(created_at);

        Ok(Some(ChatOverview {
            chat_id,
            name,
            member_ids,
            last_message,
            last_activity,
            unread,
        }))
    }

    /// Every chat the user belongs to, ordered descending by last activity.
    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatOverview>> {
        let rows = sqlx::query("SELECT chat_id FROM chat_members WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        let mut overviews = Vec::with_capacity(rows.len());
        for row in rows {
            let chat_id = ChatId(row.get::<i64, _>(0));
            if let Some(overview) = self.chat_overview(chat_id, user_id).await? {
                overviews.push(overview);
            }
        }
        overviews.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(overviews)
    }
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Ordinary => "ordinary",
        MessageKind::System => "system",
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow, readers: Vec<UserId>) -> Result<StoredMessage> {
    let attachments: Vec<AttachmentPayload> =
        serde_json::from_str(&row.get::<String, _>("attachments_json"))
            .context("corrupt attachments column")?;
    let kind = match row.get::<String, _>("kind").as_str() {
        "system" => MessageKind::System,
        _ => MessageKind::Ordinary,
    };
    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>("id")),
        chat_id: ChatId(row.get::<i64, _>("chat_id")),
        author_id: UserId(row.get::<i64, _>("author_id")),
        body: MessageBody {
            text: row.get::<Option<String>, _>("body_text"),
            attachments,
        },
        kind,
        edited: row.get::<bool, _>("edited"),
        readers,
        client_tag: row.get::<Option<String>, _>("client_tag"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}
