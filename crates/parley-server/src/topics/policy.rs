//! Per-root subscription rules.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parley_core::ids::ChatroomId;
use parley_core::validation;
use parley_core::TopicPath;
use parley_store::StoreError;
use serde_json::{json, Value};

use super::registry::SubscriptionRegistry;
use crate::connection::Connection;
use crate::data::DataAccess;
use crate::frame::BroadcastMessage;

pub const CHAT_ROOMS: &str = "chat-rooms";
pub const PRESENCE: &str = "presence";
pub const MESSAGES: &str = "messages";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a root does around membership changes.
///
/// The membership hooks run under the root lock, so anything they deliver is
/// ordered with every other broadcast on that root.
#[async_trait]
pub trait TopicPolicy: Send + Sync + 'static {
    fn root(&self) -> &'static str;

    /// Whether `params` (segments after the root) name a valid subscription.
    fn accepts(&self, params: &[String]) -> bool;

    /// Roots with a store-backed snapshot return true; their new members
    /// stay pending until [`Self::load_snapshot`] resolves.
    fn deferred_snapshot(&self) -> bool {
        false
    }

    async fn load_snapshot(&self, _path: &TopicPath) -> Result<Vec<Value>, SnapshotError> {
        Ok(Vec::new())
    }

    fn on_added(&self, _registry: &mut SubscriptionRegistry, _path: &str, _conn: &Arc<Connection>) {}

    fn on_removed(
        &self,
        _registry: &mut SubscriptionRegistry,
        _path: &str,
        _conn: &Arc<Connection>,
    ) {
    }
}

fn to_values<T: serde::Serialize>(items: Vec<T>) -> Result<Vec<Value>, SnapshotError> {
    items
        .into_iter()
        .map(|item| serde_json::to_value(item).map_err(SnapshotError::from))
        .collect()
}

/// `chat-rooms` or `chat-rooms.<owner>`.
pub struct ChatroomsPolicy {
    data: Arc<dyn DataAccess>,
}

impl ChatroomsPolicy {
    pub fn new(data: Arc<dyn DataAccess>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl TopicPolicy for ChatroomsPolicy {
    fn root(&self) -> &'static str {
        CHAT_ROOMS
    }

    fn accepts(&self, params: &[String]) -> bool {
        match params {
            [] => true,
            [owner] => validation::is_username(owner),
            _ => false,
        }
    }

    fn deferred_snapshot(&self) -> bool {
        true
    }

    async fn load_snapshot(&self, path: &TopicPath) -> Result<Vec<Value>, SnapshotError> {
        let rooms = match path.params() {
            [owner] => self.data.chatrooms_by_owner(owner).await?,
            _ => self.data.chatrooms().await?,
        };
        to_values(rooms)
    }
}

/// `messages.<chatroom-id>` or `messages.<username>`.
pub struct MessagesPolicy {
    data: Arc<dyn DataAccess>,
}

impl MessagesPolicy {
    pub fn new(data: Arc<dyn DataAccess>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl TopicPolicy for MessagesPolicy {
    fn root(&self) -> &'static str {
        MESSAGES
    }

    /// Chatroom ids are stored and broadcast lowercase, so an uppercase id
    /// would register a path no event ever reaches.
    fn accepts(&self, params: &[String]) -> bool {
        matches!(params, [scope] if validation::is_identifier(scope)
            && !(validation::is_uuid(scope) && scope.bytes().any(|b| b.is_ascii_uppercase())))
    }

    fn deferred_snapshot(&self) -> bool {
        true
    }

    async fn load_snapshot(&self, path: &TopicPath) -> Result<Vec<Value>, SnapshotError> {
        let Some(scope) = path.params().first() else {
            return Ok(Vec::new());
        };
        let messages = if validation::is_uuid(scope) {
            self.data
                .messages_by_chatroom(&ChatroomId::from_raw(scope.as_str()))
                .await?
        } else {
            self.data.messages_by_username(scope).await?
        };
        to_values(messages)
    }
}

/// `presence` or `presence.<scope>`: who else is here.
///
/// The snapshot comes from the registry itself, so it is sent synchronously.
pub struct PresencePolicy;

#[async_trait]
impl TopicPolicy for PresencePolicy {
    fn root(&self) -> &'static str {
        PRESENCE
    }

    fn accepts(&self, params: &[String]) -> bool {
        match params {
            [] => true,
            [scope] => validation::is_identifier(scope),
            _ => false,
        }
    }

    fn on_added(&self, registry: &mut SubscriptionRegistry, path: &str, conn: &Arc<Connection>) {
        let others: BTreeSet<String> = registry
            .members(path)
            .iter()
            .filter(|member| member.id != conn.id)
            .filter_map(|member| member.identity().map(str::to_owned))
            .collect();
        let snapshot = others
            .into_iter()
            .map(|username| json!({ "username": username }))
            .collect();
        conn.send(BroadcastMessage::snapshot(path, snapshot).to_frame());

        if let Some(username) = conn.identity() {
            let insert = BroadcastMessage::insert(path, json!({ "username": username }));
            registry.deliver(path, &insert.to_frame());
        }
    }

    fn on_removed(&self, registry: &mut SubscriptionRegistry, path: &str, conn: &Arc<Connection>) {
        if let Some(username) = conn.identity() {
            let delete = BroadcastMessage::delete(path, json!({ "username": username }));
            registry.deliver(path, &delete.to_frame());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn presence_arity() {
        let p = PresencePolicy;
        assert!(p.accepts(&[]));
        assert!(p.accepts(&params(&["room7"])));
        assert!(!p.accepts(&params(&["a", "b"])));
        assert!(!p.accepts(&params(&["not valid!"])));
    }

    #[test]
    fn messages_requires_one_identifier() {
        let p = MessagesPolicy::new(Arc::new(crate::topics::test_support::FakeData::default()));
        assert!(!p.accepts(&[]));
        assert!(p.accepts(&params(&["alice"])));
        assert!(p.accepts(&params(&["0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b"])));
        assert!(!p.accepts(&params(&["alice", "x"])));
    }

    #[test]
    fn messages_rejects_uppercase_room_ids() {
        let p = MessagesPolicy::new(Arc::new(crate::topics::test_support::FakeData::default()));
        assert!(!p.accepts(&params(&["0190A1B2-C3D4-7E5F-8A9B-0C1D2E3F4A5B"])));
        assert!(!p.accepts(&params(&["0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4A5b"])));
        assert!(p.accepts(&params(&["Alice"])));
    }

    #[test]
    fn chatrooms_optional_owner() {
        let p = ChatroomsPolicy::new(Arc::new(crate::topics::test_support::FakeData::default()));
        assert!(p.accepts(&[]));
        assert!(p.accepts(&params(&["alice"])));
        assert!(!p.accepts(&params(&["al-ice"])));
    }
}
