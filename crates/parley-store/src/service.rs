//! Validating mutation layer over the repos.
//!
//! Every successful write is followed by exactly one [`MutationEvent`] on the
//! broadcast channel. Reads never publish.

use tokio::sync::broadcast;
use tracing::{debug, instrument};

use parley_core::ids::{ChatroomId, MessageId};
use parley_core::model::{ChatMessage, Chatroom, User};
use parley_core::security::{derive_api_key, Credential};
use parley_core::validation;
use parley_core::MutationEvent;

use crate::chatrooms::ChatroomRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::users::UserRepo;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid {0}")]
    Invalid(&'static str),

    #[error("invalid credentials")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Store(other),
        }
    }
}

/// An account together with the key it currently authenticates with.
#[derive(Clone, Debug)]
pub struct KeyedUser {
    pub user: User,
    pub api_key: String,
}

#[derive(Clone)]
pub struct ChatService {
    db: Database,
    events: broadcast::Sender<MutationEvent>,
}

impl ChatService {
    pub fn new(db: Database, events: broadcast::Sender<MutationEvent>) -> Self {
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
            .map_err(ServiceError::from)
    }

    fn publish(&self, event: MutationEvent) {
        let kind = event.event_type();
        // No receivers just means nobody is listening yet.
        match self.events.send(event) {
            Ok(receivers) => debug!(kind, receivers, "mutation published"),
            Err(_) => debug!(kind, "mutation published without receivers"),
        }
    }

    /// Resolve request credentials to a user.
    #[instrument(skip(self, api_key))]
    pub async fn authenticate(&self, username: &str, api_key: &Credential) -> Result<User, ServiceError> {
        if !validation::is_username(username) || !validation::is_credential(api_key.expose()) {
            return Err(ServiceError::Unauthorized);
        }
        let name = username.to_string();
        let row = self
            .blocking(move |db| UserRepo::new(db).find(&name))
            .await?
            .ok_or(ServiceError::Unauthorized)?;
        if !api_key.matches(&row.api_key) {
            return Err(ServiceError::Unauthorized);
        }
        Ok(row.to_user())
    }

    #[instrument(skip(self, password, description))]
    pub async fn create_user(
        &self,
        username: &str,
        password: &Credential,
        description: &str,
    ) -> Result<KeyedUser, ServiceError> {
        if !validation::is_username(username) {
            return Err(ServiceError::Invalid("username"));
        }
        if !validation::is_password(password.expose()) {
            return Err(ServiceError::Invalid("password"));
        }
        if !validation::is_description(description) {
            return Err(ServiceError::Invalid("description"));
        }
        let api_key = derive_api_key(username, password);
        let (name, key, desc) = (username.to_string(), api_key.clone(), description.to_string());
        let row = self
            .blocking(move |db| UserRepo::new(db).insert(&name, &key, &desc))
            .await?;
        let user = row.to_user();
        self.publish(MutationEvent::UserCreated { user: user.clone() });
        Ok(KeyedUser { user, api_key })
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>, ServiceError> {
        let rows = self.blocking(|db| UserRepo::new(db).list()).await?;
        Ok(rows.iter().map(|row| row.to_user()).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, username: &str) -> Result<User, ServiceError> {
        if !validation::is_username(username) {
            return Err(ServiceError::Invalid("username"));
        }
        let name = username.to_string();
        let row = self.blocking(move |db| UserRepo::new(db).get(&name)).await?;
        Ok(row.to_user())
    }

    /// Change a user's password (and with it the api key) and/or description.
    /// Users may only update themselves.
    #[instrument(skip(self, password, description))]
    pub async fn update_user(
        &self,
        actor: &User,
        username: &str,
        password: Option<&Credential>,
        description: Option<&str>,
    ) -> Result<KeyedUser, ServiceError> {
        if !validation::is_username(username) {
            return Err(ServiceError::Invalid("username"));
        }
        if password.is_some_and(|p| !validation::is_password(p.expose())) {
            return Err(ServiceError::Invalid("password"));
        }
        if description.is_some_and(|d| !validation::is_description(d)) {
            return Err(ServiceError::Invalid("description"));
        }
        if actor.username != username {
            return Err(ServiceError::Forbidden(format!("user {username}")));
        }
        let new_key = password.map(|p| derive_api_key(username, p));
        let (name, key, desc) = (
            username.to_string(),
            new_key.clone(),
            description.map(str::to_owned),
        );
        let row = self
            .blocking(move |db| UserRepo::new(db).update(&name, key.as_deref(), desc.as_deref()))
            .await?;
        let user = row.to_user();
        self.publish(MutationEvent::UserUpdated { user: user.clone() });
        Ok(KeyedUser {
            user,
            api_key: row.api_key,
        })
    }

    /// Users may only delete themselves.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, actor: &User, username: &str) -> Result<(), ServiceError> {
        if actor.username != username {
            return Err(ServiceError::Forbidden(format!("user {username}")));
        }
        let name = username.to_string();
        self.blocking(move |db| UserRepo::new(db).delete(&name)).await?;
        self.publish(MutationEvent::UserDeleted {
            username: username.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_chatrooms(&self) -> Result<Vec<Chatroom>, ServiceError> {
        self.blocking(|db| ChatroomRepo::new(db).list()).await
    }

    #[instrument(skip(self))]
    pub async fn list_chatrooms_by_owner(&self, owner: &str) -> Result<Vec<Chatroom>, ServiceError> {
        if !validation::is_username(owner) {
            return Err(ServiceError::Invalid("username"));
        }
        let owner = owner.to_string();
        self.blocking(move |db| ChatroomRepo::new(db).list_by_owner(&owner))
            .await
    }

    #[instrument(skip(self))]
    pub async fn create_chatroom(&self, owner: &User, topic: &str) -> Result<Chatroom, ServiceError> {
        if !validation::is_chatroom_topic(topic) {
            return Err(ServiceError::Invalid("topic"));
        }
        let (topic, owner_name) = (topic.to_string(), owner.username.clone());
        let chatroom = self
            .blocking(move |db| ChatroomRepo::new(db).insert(&topic, &owner_name))
            .await?;
        self.publish(MutationEvent::ChatroomCreated {
            chatroom: chatroom.clone(),
        });
        Ok(chatroom)
    }

    /// Only the owner may delete a room; its messages go with it.
    #[instrument(skip(self))]
    pub async fn delete_chatroom(&self, actor: &User, id: &str) -> Result<Chatroom, ServiceError> {
        if !validation::is_uuid(id) {
            return Err(ServiceError::Invalid("chatroom id"));
        }
        let id = ChatroomId::from_raw(id);
        let lookup = id.clone();
        let existing = self
            .blocking(move |db| ChatroomRepo::new(db).get(&lookup))
            .await?;
        if existing.owner_username != actor.username {
            return Err(ServiceError::Forbidden(format!("chatroom {id}")));
        }
        let chatroom = self
            .blocking(move |db| ChatroomRepo::new(db).delete(&id))
            .await?;
        self.publish(MutationEvent::ChatroomDeleted {
            chatroom: chatroom.clone(),
        });
        Ok(chatroom)
    }

    #[instrument(skip(self))]
    pub async fn list_messages_by_chatroom(&self, id: &str) -> Result<Vec<ChatMessage>, ServiceError> {
        if !validation::is_uuid(id) {
            return Err(ServiceError::Invalid("chatroom id"));
        }
        let id = ChatroomId::from_raw(id);
        self.blocking(move |db| {
            ChatroomRepo::new(db.clone()).get(&id)?;
            MessageRepo::new(db).list_by_chatroom(&id)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_messages_by_user(&self, username: &str) -> Result<Vec<ChatMessage>, ServiceError> {
        if !validation::is_username(username) {
            return Err(ServiceError::Invalid("username"));
        }
        let name = username.to_string();
        self.blocking(move |db| MessageRepo::new(db).list_by_username(&name))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_message(&self, id: &str) -> Result<ChatMessage, ServiceError> {
        if !validation::is_uuid(id) {
            return Err(ServiceError::Invalid("message id"));
        }
        let id = MessageId::from_raw(id);
        self.blocking(move |db| MessageRepo::new(db).get(&id)).await
    }

    #[instrument(skip(self, content))]
    pub async fn post_message(
        &self,
        author: &User,
        chatroom_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ServiceError> {
        if !validation::is_uuid(chatroom_id) {
            return Err(ServiceError::Invalid("chatroom id"));
        }
        if !validation::is_content(content) {
            return Err(ServiceError::Invalid("content"));
        }
        let room = ChatroomId::from_raw(chatroom_id);
        let (author_name, content) = (author.username.clone(), content.to_string());
        let message = self
            .blocking(move |db| {
                ChatroomRepo::new(db.clone()).get(&room)?;
                MessageRepo::new(db).insert(&author_name, &room, &content)
            })
            .await?;
        self.publish(MutationEvent::MessageCreated {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Only the author may delete a message.
    #[instrument(skip(self))]
    pub async fn delete_message(&self, actor: &User, id: &str) -> Result<ChatMessage, ServiceError> {
        if !validation::is_uuid(id) {
            return Err(ServiceError::Invalid("message id"));
        }
        let id = MessageId::from_raw(id);
        let lookup = id.clone();
        let existing = self
            .blocking(move |db| MessageRepo::new(db).get(&lookup))
            .await?;
        if existing.username != actor.username {
            return Err(ServiceError::Forbidden(format!("message {id}")));
        }
        let message = self
            .blocking(move |db| MessageRepo::new(db).delete(&id))
            .await?;
        self.publish(MutationEvent::MessageDeleted {
            message: message.clone(),
        });
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (ChatService, broadcast::Receiver<MutationEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (ChatService::new(Database::in_memory().unwrap(), tx), rx)
    }

    async fn user(svc: &ChatService, name: &str) -> User {
        svc.create_user(name, &Credential::new("passw0rd"), "")
            .await
            .unwrap()
            .user
    }

    #[tokio::test]
    async fn create_user_publishes_and_returns_key() {
        let (svc, mut rx) = service();
        let created = svc
            .create_user("alice", &Credential::new("passw0rd"), "hi")
            .await
            .unwrap();
        assert_eq!(created.user.username, "alice");
        assert!(validation::is_credential(&created.api_key));
        assert_eq!(
            rx.recv().await.unwrap(),
            MutationEvent::UserCreated {
                user: created.user.clone()
            }
        );

        let authed = svc
            .authenticate("alice", &Credential::new(created.api_key))
            .await
            .unwrap();
        assert_eq!(authed.username, "alice");
    }

    #[tokio::test]
    async fn create_user_validates_input() {
        let (svc, _rx) = service();
        let weak = svc.create_user("alice", &Credential::new("short1"), "").await;
        assert!(matches!(weak, Err(ServiceError::Invalid("password"))));
        let digitless = svc.create_user("alice", &Credential::new("password"), "").await;
        assert!(matches!(digitless, Err(ServiceError::Invalid("password"))));
        let bad_name = svc.create_user("al ice", &Credential::new("passw0rd"), "").await;
        assert!(matches!(bad_name, Err(ServiceError::Invalid("username"))));
    }

    #[tokio::test]
    async fn overlong_description_is_invalid() {
        let (svc, _rx) = service();
        let long = "d".repeat(validation::MAX_DESCRIPTION_LEN + 1);
        let res = svc.create_user("alice", &Credential::new("passw0rd"), &long).await;
        assert!(matches!(res, Err(ServiceError::Invalid("description"))));
    }

    #[tokio::test]
    async fn list_and_get_users() {
        let (svc, _rx) = service();
        svc.create_user("carol", &Credential::new("passw0rd"), "hi")
            .await
            .unwrap();
        user(&svc, "alice").await;

        let names: Vec<_> = svc
            .list_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);

        let carol = svc.get_user("carol").await.unwrap();
        assert_eq!(carol.description, "hi");
        assert!(matches!(svc.get_user("ghost").await, Err(ServiceError::NotFound(_))));
        assert!(matches!(svc.get_user("no one").await, Err(ServiceError::Invalid("username"))));
    }

    #[tokio::test]
    async fn update_user_rotates_key_and_publishes() {
        let (svc, mut rx) = service();
        let created = svc
            .create_user("alice", &Credential::new("passw0rd"), "old")
            .await
            .unwrap();
        let bob = user(&svc, "bob").await;
        while rx.try_recv().is_ok() {}

        let denied = svc
            .update_user(&bob, "alice", None, Some("hijacked"))
            .await;
        assert!(matches!(denied, Err(ServiceError::Forbidden(_))));

        let same_key = svc
            .update_user(&created.user, "alice", None, Some("new"))
            .await
            .unwrap();
        assert_eq!(same_key.api_key, created.api_key);
        assert_eq!(same_key.user.description, "new");
        assert_eq!(
            rx.recv().await.unwrap(),
            MutationEvent::UserUpdated {
                user: same_key.user.clone()
            }
        );

        let rotated = svc
            .update_user(&created.user, "alice", Some(&Credential::new("n3wpassword")), None)
            .await
            .unwrap();
        assert_ne!(rotated.api_key, created.api_key);
        assert_eq!(rotated.user.description, "new");
        assert!(svc
            .authenticate("alice", &Credential::new(created.api_key))
            .await
            .is_err());
        assert!(svc
            .authenticate("alice", &Credential::new(rotated.api_key))
            .await
            .is_ok());

        let weak = svc
            .update_user(&created.user, "alice", Some(&Credential::new("weak")), None)
            .await;
        assert!(matches!(weak, Err(ServiceError::Invalid("password"))));
    }

    #[tokio::test]
    async fn duplicate_user_conflicts() {
        let (svc, _rx) = service();
        user(&svc, "alice").await;
        let again = svc.create_user("alice", &Credential::new("passw0rd"), "").await;
        assert!(matches!(again, Err(ServiceError::Conflict(_))));
    }

    #[tokio::test]
    async fn authenticate_rejects_wrong_key() {
        let (svc, _rx) = service();
        user(&svc, "alice").await;
        let wrong = derive_api_key("alice", &Credential::new("other1234"));
        let res = svc.authenticate("alice", &Credential::new(wrong)).await;
        assert!(matches!(res, Err(ServiceError::Unauthorized)));
        let res = svc.authenticate("alice", &Credential::new("nothex")).await;
        assert!(matches!(res, Err(ServiceError::Unauthorized)));
        let res = svc
            .authenticate("ghost", &Credential::new("a".repeat(64)))
            .await;
        assert!(matches!(res, Err(ServiceError::Unauthorized)));
    }

    #[tokio::test]
    async fn chatroom_lifecycle_and_ownership() {
        let (svc, mut rx) = service();
        let alice = user(&svc, "alice").await;
        let bob = user(&svc, "bob").await;
        while rx.try_recv().is_ok() {}

        let room = svc.create_chatroom(&alice, "rust").await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            MutationEvent::ChatroomCreated { .. }
        ));
        assert_eq!(svc.list_chatrooms_by_owner("alice").await.unwrap(), vec![room.clone()]);

        let denied = svc.delete_chatroom(&bob, room.id.as_str()).await;
        assert!(matches!(denied, Err(ServiceError::Forbidden(_))));

        svc.post_message(&bob, room.id.as_str(), "hi").await.unwrap();
        let removed = svc.delete_chatroom(&alice, room.id.as_str()).await.unwrap();
        assert_eq!(removed, room);
        assert!(svc.list_chatrooms().await.unwrap().is_empty());
        assert!(svc.list_messages_by_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_topic_is_invalid() {
        let (svc, _rx) = service();
        let alice = user(&svc, "alice").await;
        let res = svc.create_chatroom(&alice, "").await;
        assert!(matches!(res, Err(ServiceError::Invalid("topic"))));
    }

    #[tokio::test]
    async fn messages_post_and_delete() {
        let (svc, mut rx) = service();
        let alice = user(&svc, "alice").await;
        let bob = user(&svc, "bob").await;
        let room = svc.create_chatroom(&alice, "rust").await.unwrap();
        while rx.try_recv().is_ok() {}

        let msg = svc.post_message(&bob, room.id.as_str(), "hello").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            MutationEvent::MessageCreated {
                message: msg.clone()
            }
        );
        assert_eq!(
            svc.list_messages_by_chatroom(room.id.as_str()).await.unwrap(),
            vec![msg.clone()]
        );

        let denied = svc.delete_message(&alice, msg.id.as_str()).await;
        assert!(matches!(denied, Err(ServiceError::Forbidden(_))));

        svc.delete_message(&bob, msg.id.as_str()).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            MutationEvent::MessageDeleted { message: msg }
        );
    }

    #[tokio::test]
    async fn posting_to_missing_room_is_not_found() {
        let (svc, _rx) = service();
        let bob = user(&svc, "bob").await;
        let missing = ChatroomId::new();
        let res = svc.post_message(&bob, missing.as_str(), "x").await;
        assert!(matches!(res, Err(ServiceError::NotFound(_))));
        let res = svc.post_message(&bob, "not-a-uuid", "x").await;
        assert!(matches!(res, Err(ServiceError::Invalid("chatroom id"))));
    }

    #[tokio::test]
    async fn user_delete_rules() {
        let (svc, _rx) = service();
        let alice = user(&svc, "alice").await;
        let bob = user(&svc, "bob").await;

        let denied = svc.delete_user(&bob, "alice").await;
        assert!(matches!(denied, Err(ServiceError::Forbidden(_))));

        svc.create_chatroom(&alice, "rust").await.unwrap();
        let still_owns = svc.delete_user(&alice, "alice").await;
        assert!(matches!(still_owns, Err(ServiceError::Conflict(_))));

        svc.delete_user(&bob, "bob").await.unwrap();
        let gone = svc
            .authenticate("bob", &Credential::new(derive_api_key("bob", &Credential::new("passw0rd"))))
            .await;
        assert!(matches!(gone, Err(ServiceError::Unauthorized)));
    }
}
