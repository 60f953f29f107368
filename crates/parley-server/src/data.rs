use async_trait::async_trait;
use parley_core::ids::ChatroomId;
use parley_core::model::{ChatMessage, Chatroom};
use parley_store::chatrooms::ChatroomRepo;
use parley_store::messages::MessageRepo;
use parley_store::users::UserRepo;
use parley_store::{Database, StoreError};

/// Reads the live channel needs from persistent storage.
#[async_trait]
pub trait DataAccess: Send + Sync + 'static {
    /// Stored api key for a user, `None` if the user does not exist.
    async fn api_key_for(&self, username: &str) -> Result<Option<String>, StoreError>;
    async fn chatrooms(&self) -> Result<Vec<Chatroom>, StoreError>;
    async fn chatrooms_by_owner(&self, owner: &str) -> Result<Vec<Chatroom>, StoreError>;
    async fn messages_by_chatroom(&self, id: &ChatroomId) -> Result<Vec<ChatMessage>, StoreError>;
    async fn messages_by_username(&self, username: &str) -> Result<Vec<ChatMessage>, StoreError>;
}

/// [`DataAccess`] over the SQLite store. Each call runs on the blocking pool.
#[derive(Clone)]
pub struct StoreDataAccess {
    db: Database,
}

impl StoreDataAccess {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl DataAccess for StoreDataAccess {
    async fn api_key_for(&self, username: &str) -> Result<Option<String>, StoreError> {
        let username = username.to_string();
        self.blocking(move |db| Ok(UserRepo::new(db).find(&username)?.map(|row| row.api_key)))
            .await
    }

    async fn chatrooms(&self) -> Result<Vec<Chatroom>, StoreError> {
        self.blocking(|db| ChatroomRepo::new(db).list()).await
    }

    async fn chatrooms_by_owner(&self, owner: &str) -> Result<Vec<Chatroom>, StoreError> {
        let owner = owner.to_string();
        self.blocking(move |db| ChatroomRepo::new(db).list_by_owner(&owner))
            .await
    }

    async fn messages_by_chatroom(&self, id: &ChatroomId) -> Result<Vec<ChatMessage>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| MessageRepo::new(db).list_by_chatroom(&id))
            .await
    }

    async fn messages_by_username(&self, username: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let username = username.to_string();
        self.blocking(move |db| MessageRepo::new(db).list_by_username(&username))
            .await
    }
}
