use serde::{Deserialize, Serialize};

use crate::ids::{ChatroomId, MessageId};

/// Public view of a user. The api key never leaves the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chatroom {
    pub id: ChatroomId,
    pub topic: String,
    pub owner_username: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub username: String,
    pub chatroom_id: ChatroomId,
    pub content: String,
    /// Epoch milliseconds.
    pub creation_time: i64,
}
