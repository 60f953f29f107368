use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::instrument;

use parley_core::model::User;

use crate::database::Database;
use crate::error::StoreError;

/// Stored form of a user. The api key stays on this side of the store boundary.
#[derive(Clone, Debug, Serialize)]
pub struct UserRow {
    pub username: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub description: String,
    pub created_at: String,
}

impl UserRow {
    pub fn to_user(&self) -> User {
        User {
            username: self.username.clone(),
            description: self.description.clone(),
        }
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        username: row.get(0)?,
        api_key: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new user. A taken username is a [`StoreError::Conflict`].
    #[instrument(skip(self, api_key))]
    pub fn insert(
        &self,
        username: &str,
        api_key: &str,
        description: &str,
    ) -> Result<UserRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, api_key, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, api_key, description, now],
            )?;
            Ok(UserRow {
                username: username.to_string(),
                api_key: api_key.to_string(),
                description: description.to_string(),
                created_at: now,
            })
        })
    }

    /// Look a user up by name; `None` when absent.
    #[instrument(skip(self))]
    pub fn find(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT username, api_key, description, created_at FROM users WHERE username = ?1",
                    [username],
                    map_row,
                )
                .optional()?)
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, username: &str) -> Result<UserRow, StoreError> {
        self.find(username)?
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, api_key, description, created_at FROM users ORDER BY username",
            )?;
            let rows = stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replace the api key and/or description; `None` keeps the stored value.
    #[instrument(skip(self, api_key, description))]
    pub fn update(
        &self,
        username: &str,
        api_key: Option<&str>,
        description: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET api_key = COALESCE(?2, api_key), description = COALESCE(?3, description)
                 WHERE username = ?1",
                rusqlite::params![username, api_key, description],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {username}")));
            }
            Ok(conn.query_row(
                "SELECT username, api_key, description, created_at FROM users WHERE username = ?1",
                [username],
                map_row,
            )?)
        })
    }

    /// Delete a user. Fails with `Conflict` while rooms or messages still
    /// reference them, and `NotFound` if there was no such user.
    #[instrument(skip(self))]
    pub fn delete(&self, username: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM users WHERE username = ?1", [username])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {username}")));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::in_memory().unwrap()
    }

    #[test]
    fn insert_and_get() {
        let repo = UserRepo::new(test_db());
        repo.insert("alice", "k1", "likes rust").unwrap();

        let row = repo.get("alice").unwrap();
        assert_eq!(row.username, "alice");
        assert_eq!(row.api_key, "k1");
        assert_eq!(row.description, "likes rust");
        assert_eq!(row.to_user().username, "alice");
    }

    #[test]
    fn duplicate_username_conflicts() {
        let repo = UserRepo::new(test_db());
        repo.insert("alice", "k1", "").unwrap();
        let err = repo.insert("alice", "k2", "").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");
    }

    #[test]
    fn find_missing_is_none() {
        let repo = UserRepo::new(test_db());
        assert!(repo.find("ghost").unwrap().is_none());
        assert!(matches!(repo.get("ghost"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_is_sorted() {
        let repo = UserRepo::new(test_db());
        repo.insert("carol", "k", "").unwrap();
        repo.insert("alice", "k", "").unwrap();
        let names: Vec<_> = repo.list().unwrap().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[test]
    fn update_keeps_unset_fields() {
        let repo = UserRepo::new(test_db());
        repo.insert("alice", "k1", "old").unwrap();

        let row = repo.update("alice", None, Some("new")).unwrap();
        assert_eq!(row.api_key, "k1");
        assert_eq!(row.description, "new");

        let row = repo.update("alice", Some("k2"), None).unwrap();
        assert_eq!(row.api_key, "k2");
        assert_eq!(row.description, "new");

        assert!(matches!(
            repo.update("ghost", Some("k"), None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_user() {
        let repo = UserRepo::new(test_db());
        repo.insert("alice", "k", "").unwrap();
        repo.delete("alice").unwrap();
        assert!(repo.find("alice").unwrap().is_none());
        assert!(matches!(repo.delete("alice"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn api_key_not_serialized() {
        let repo = UserRepo::new(test_db());
        let row = repo.insert("alice", "secret", "").unwrap();
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("api_key").is_none());
    }
}
