use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::ids::{ChatroomId, MessageId};
use parley_core::model::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;

const COLUMNS: &str = "id, username, chatroom_id, content, creation_time";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        username: row.get(1)?,
        chatroom_id: ChatroomId::from_raw(row.get::<_, String>(2)?),
        content: row.get(3)?,
        creation_time: row.get(4)?,
    })
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message stamped with the current time.
    #[instrument(skip(self, content), fields(chatroom_id = %chatroom_id))]
    pub fn insert(
        &self,
        username: &str,
        chatroom_id: &ChatroomId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: MessageId::new(),
            username: username.to_string(),
            chatroom_id: chatroom_id.clone(),
            content: content.to_string(),
            creation_time: Utc::now().timestamp_millis(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO messages ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                rusqlite::params![
                    message.id.as_str(),
                    message.username,
                    message.chatroom_id.as_str(),
                    message.content,
                    message.creation_time,
                ],
            )?;
            Ok(())
        })?;
        Ok(message)
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn find(&self, id: &MessageId) -> Result<Option<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                    [id.as_str()],
                    map_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<ChatMessage, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    /// Messages in a room, oldest first.
    #[instrument(skip(self), fields(chatroom_id = %chatroom_id))]
    pub fn list_by_chatroom(&self, chatroom_id: &ChatroomId) -> Result<Vec<ChatMessage>, StoreError> {
        self.list_where("chatroom_id", chatroom_id.as_str())
    }

    /// Messages written by a user, oldest first.
    #[instrument(skip(self))]
    pub fn list_by_username(&self, username: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.list_where("username", username)
    }

    fn list_where(&self, column: &'static str, value: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE {column} = ?1 ORDER BY creation_time, id"
            ))?;
            let rows = stmt.query_map([value], map_row)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete one message and return it.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn delete(&self, id: &MessageId) -> Result<ChatMessage, StoreError> {
        self.db.with_tx(|tx| {
            let message = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                    [id.as_str()],
                    map_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
            tx.execute("DELETE FROM messages WHERE id = ?1", [id.as_str()])?;
            Ok(message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatrooms::ChatroomRepo;
    use crate::users::UserRepo;

    fn setup() -> (MessageRepo, ChatroomId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.insert("alice", "k", "").unwrap();
        users.insert("bob", "k", "").unwrap();
        let room = ChatroomRepo::new(db.clone()).insert("rust", "alice").unwrap();
        (MessageRepo::new(db), room.id)
    }

    #[test]
    fn insert_and_get() {
        let (repo, room) = setup();
        let msg = repo.insert("bob", &room, "hello").unwrap();
        assert!(msg.creation_time > 0);
        assert_eq!(repo.get(&msg.id).unwrap(), msg);
    }

    #[test]
    fn list_by_room_and_user() {
        let (repo, room) = setup();
        let first = repo.insert("bob", &room, "one").unwrap();
        let second = repo.insert("alice", &room, "two").unwrap();
        let third = repo.insert("bob", &room, "three").unwrap();

        let in_room = repo.list_by_chatroom(&room).unwrap();
        assert_eq!(in_room, vec![first.clone(), second, third.clone()]);

        let by_bob = repo.list_by_username("bob").unwrap();
        assert_eq!(by_bob, vec![first, third]);
        assert!(repo.list_by_username("carol").unwrap().is_empty());
    }

    #[test]
    fn unknown_room_conflicts() {
        let (repo, _) = setup();
        let err = repo.insert("bob", &ChatroomId::new(), "x").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn delete_returns_removed_message() {
        let (repo, room) = setup();
        let msg = repo.insert("bob", &room, "bye").unwrap();
        let removed = repo.delete(&msg.id).unwrap();
        assert_eq!(removed, msg);
        assert!(repo.find(&msg.id).unwrap().is_none());
        assert!(matches!(repo.delete(&msg.id), Err(StoreError::NotFound(_))));
    }
}
