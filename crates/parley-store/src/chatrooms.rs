use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::ids::ChatroomId;
use parley_core::model::Chatroom;

use crate::database::Database;
use crate::error::StoreError;

const COLUMNS: &str = "id, topic, owner_username";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chatroom> {
    Ok(Chatroom {
        id: ChatroomId::from_raw(row.get::<_, String>(0)?),
        topic: row.get(1)?,
        owner_username: row.get(2)?,
    })
}

pub struct ChatroomRepo {
    db: Database,
}

impl ChatroomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a room. Titles are unique across the server.
    #[instrument(skip(self))]
    pub fn insert(&self, topic: &str, owner_username: &str) -> Result<Chatroom, StoreError> {
        let room = Chatroom {
            id: ChatroomId::new(),
            topic: topic.to_string(),
            owner_username: owner_username.to_string(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chatrooms (id, topic, owner_username) VALUES (?1, ?2, ?3)",
                rusqlite::params![room.id.as_str(), room.topic, room.owner_username],
            )?;
            Ok(())
        })?;
        Ok(room)
    }

    #[instrument(skip(self), fields(chatroom_id = %id))]
    pub fn find(&self, id: &ChatroomId) -> Result<Option<Chatroom>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM chatrooms WHERE id = ?1"),
                    [id.as_str()],
                    map_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self), fields(chatroom_id = %id))]
    pub fn get(&self, id: &ChatroomId) -> Result<Chatroom, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("chatroom {id}")))
    }

    #[instrument(skip(self))]
    pub fn find_by_topic(&self, topic: &str) -> Result<Option<Chatroom>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM chatrooms WHERE topic = ?1"),
                    [topic],
                    map_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Chatroom>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM chatrooms ORDER BY id"))?;
            let rows = stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self))]
    pub fn list_by_owner(&self, owner_username: &str) -> Result<Vec<Chatroom>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chatrooms WHERE owner_username = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([owner_username], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a room together with every message posted in it.
    /// Returns the removed room.
    #[instrument(skip(self), fields(chatroom_id = %id))]
    pub fn delete(&self, id: &ChatroomId) -> Result<Chatroom, StoreError> {
        self.db.with_tx(|tx| {
            let room = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM chatrooms WHERE id = ?1"),
                    [id.as_str()],
                    map_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("chatroom {id}")))?;
            tx.execute("DELETE FROM messages WHERE chatroom_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM chatrooms WHERE id = ?1", [id.as_str()])?;
            Ok(room)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    fn setup() -> (Database, ChatroomRepo) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.insert("alice", "k", "").unwrap();
        users.insert("bob", "k", "").unwrap();
        (db.clone(), ChatroomRepo::new(db))
    }

    #[test]
    fn insert_and_get() {
        let (_, repo) = setup();
        let room = repo.insert("rust", "alice").unwrap();
        let fetched = repo.get(&room.id).unwrap();
        assert_eq!(fetched, room);
        assert_eq!(repo.find_by_topic("rust").unwrap(), Some(room));
    }

    #[test]
    fn duplicate_topic_conflicts() {
        let (_, repo) = setup();
        repo.insert("rust", "alice").unwrap();
        let err = repo.insert("rust", "bob").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn unknown_owner_conflicts() {
        let (_, repo) = setup();
        let err = repo.insert("rust", "ghost").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn list_by_owner_filters() {
        let (_, repo) = setup();
        repo.insert("rust", "alice").unwrap();
        repo.insert("go", "bob").unwrap();
        repo.insert("zig", "alice").unwrap();

        assert_eq!(repo.list().unwrap().len(), 3);
        let mine: Vec<_> = repo
            .list_by_owner("alice")
            .unwrap()
            .into_iter()
            .map(|r| r.topic)
            .collect();
        assert_eq!(mine, vec!["rust", "zig"]);
        assert!(repo.list_by_owner("carol").unwrap().is_empty());
    }

    #[test]
    fn delete_removes_messages_too() {
        let (db, repo) = setup();
        let room = repo.insert("rust", "alice").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, username, chatroom_id, content, creation_time) VALUES ('m1', 'bob', ?1, 'hi', 1)",
                [room.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let removed = repo.delete(&room.id).unwrap();
        assert_eq!(removed.id, room.id);
        assert!(repo.find(&room.id).unwrap().is_none());

        let left: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (_, repo) = setup();
        let err = repo.delete(&ChatroomId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
