use std::sync::Arc;

use parley_core::model::{ChatMessage, Chatroom};
use parley_core::{MutationEvent, TopicError, TopicPath};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::frame::{BroadcastKind, BroadcastMessage};
use crate::topics::policy::{CHAT_ROOMS, MESSAGES};
use crate::topics::TopicChain;

/// Turn one mutation into the broadcasts it implies. User events have no
/// live topic and produce nothing.
pub fn translate(event: &MutationEvent) -> Vec<BroadcastMessage> {
    match event {
        MutationEvent::ChatroomCreated { chatroom } => fan_out(
            BroadcastKind::Insert,
            chatroom_topics(chatroom),
            to_payload(chatroom),
        ),
        MutationEvent::ChatroomDeleted { chatroom } => fan_out(
            BroadcastKind::Delete,
            chatroom_topics(chatroom),
            json!({ "id": chatroom.id }),
        ),
        MutationEvent::MessageCreated { message } => fan_out(
            BroadcastKind::Insert,
            message_topics(message),
            to_payload(message),
        ),
        MutationEvent::MessageDeleted { message } => fan_out(
            BroadcastKind::Delete,
            message_topics(message),
            json!({ "id": message.id }),
        ),
        MutationEvent::UserCreated { .. }
        | MutationEvent::UserUpdated { .. }
        | MutationEvent::UserDeleted { .. } => Vec::new(),
    }
}

fn chatroom_topics(chatroom: &Chatroom) -> Vec<String> {
    canonical_topics([
        TopicPath::scoped(CHAT_ROOMS, &[]),
        TopicPath::scoped(CHAT_ROOMS, &[chatroom.owner_username.as_str()]),
    ])
}

fn message_topics(message: &ChatMessage) -> Vec<String> {
    canonical_topics([
        TopicPath::scoped(MESSAGES, &[message.chatroom_id.as_str()]),
        TopicPath::scoped(MESSAGES, &[message.username.as_str()]),
    ])
}

/// A param that cannot form a topic is logged and skipped.
fn canonical_topics(paths: [Result<TopicPath, TopicError>; 2]) -> Vec<String> {
    paths
        .into_iter()
        .filter_map(|path| match path {
            Ok(path) => Some(path.canonical()),
            Err(error) => {
                tracing::warn!(%error, "mutation param does not form a topic");
                None
            }
        })
        .collect()
}

fn fan_out(kind: BroadcastKind, topics: Vec<String>, payload: Value) -> Vec<BroadcastMessage> {
    topics
        .into_iter()
        .map(|topic| BroadcastMessage {
            topic,
            kind,
            payload: payload.clone(),
        })
        .collect()
}

fn to_payload<T: serde::Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

/// Feeds CRUD mutations into the topic chain.
pub struct EventBridge {
    topics: Arc<TopicChain>,
}

impl EventBridge {
    pub fn new(topics: Arc<TopicChain>) -> Self {
        Self { topics }
    }

    /// Spawn the bridge task. It ends when the mutation channel closes.
    pub fn start(&self, mut rx: broadcast::Receiver<MutationEvent>) -> tokio::task::JoinHandle<()> {
        let topics = Arc::clone(&self.topics);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let messages = translate(&event);
                        if messages.is_empty() {
                            tracing::debug!(kind = event.event_type(), "mutation has no live topic");
                            continue;
                        }
                        for message in &messages {
                            topics.broadcast(message);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped mutations");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create an event bridge wired to a broadcast channel.
pub fn create_bridge(
    topics: Arc<TopicChain>,
    rx: broadcast::Receiver<MutationEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(topics).start(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::topics::test_support::chain_without_store;
    use parley_core::ids::{ChatroomId, MessageId};
    use parley_core::model::User;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn chatroom() -> Chatroom {
        Chatroom {
            id: ChatroomId::new(),
            topic: "rust".into(),
            owner_username: "alice".into(),
        }
    }

    fn message() -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            username: "bob".into(),
            chatroom_id: ChatroomId::new(),
            content: "hi".into(),
            creation_time: 1,
        }
    }

    #[test]
    fn chatroom_created_goes_to_both_paths() {
        let room = chatroom();
        let out = translate(&MutationEvent::ChatroomCreated {
            chatroom: room.clone(),
        });
        let topics: Vec<_> = out.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["chat-rooms", "chat-rooms.alice"]);
        assert!(out.iter().all(|m| m.kind == BroadcastKind::Insert));
        assert_eq!(out[0].payload["owner_username"], "alice");
    }

    #[test]
    fn chatroom_deleted_carries_id_only() {
        let room = chatroom();
        let out = translate(&MutationEvent::ChatroomDeleted {
            chatroom: room.clone(),
        });
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.kind == BroadcastKind::Delete));
        assert_eq!(out[1].payload, json!({"id": room.id.as_str()}));
    }

    #[test]
    fn message_events_target_room_and_author() {
        let msg = message();
        let out = translate(&MutationEvent::MessageCreated {
            message: msg.clone(),
        });
        let topics: Vec<_> = out.iter().map(|m| m.topic.clone()).collect();
        assert_eq!(
            topics,
            vec![format!("messages.{}", msg.chatroom_id), "messages.bob".to_string()]
        );
        assert_eq!(out[0].payload["content"], "hi");

        let out = translate(&MutationEvent::MessageDeleted { message: msg.clone() });
        assert_eq!(out[0].payload, json!({"id": msg.id.as_str()}));
    }

    #[test]
    fn user_events_produce_nothing() {
        assert!(translate(&MutationEvent::UserDeleted {
            username: "alice".into()
        })
        .is_empty());
        let user = User {
            username: "alice".into(),
            description: String::new(),
        };
        assert!(translate(&MutationEvent::UserCreated { user: user.clone() }).is_empty());
        assert!(translate(&MutationEvent::UserUpdated { user }).is_empty());
    }

    #[test]
    fn params_that_cannot_form_a_topic_are_skipped() {
        let mut room = chatroom();
        room.owner_username = "al.ice".into();
        let out = translate(&MutationEvent::ChatroomCreated { chatroom: room });
        let topics: Vec<_> = out.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["chat-rooms"]);
    }

    #[tokio::test]
    async fn bridge_forwards_to_subscribers() {
        let topics = Arc::new(chain_without_store());
        let (tx, rx) = broadcast::channel(16);
        let (conn_tx, mut conn_rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(conn_tx));
        conn.set_identity("carol");

        topics.add_subscription(&TopicPath::parse("chat-rooms.alice").unwrap(), &conn);
        let snapshot = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.contains("\"snapshot\""));

        let handle = create_bridge(Arc::clone(&topics), rx);
        tx.send(MutationEvent::ChatroomCreated { chatroom: chatroom() })
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["topic"], "chat-rooms.alice");
        assert_eq!(value["kind"], "insert");

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
