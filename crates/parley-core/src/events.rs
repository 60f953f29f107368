use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, Chatroom, User};

/// Mutations raised by the CRUD layer after a change has been persisted.
/// Consumers turn these into live notifications; they never write back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MutationEvent {
    #[serde(rename = "user_created")]
    UserCreated { user: User },

    #[serde(rename = "user_updated")]
    UserUpdated { user: User },

    #[serde(rename = "user_deleted")]
    UserDeleted { username: String },

    #[serde(rename = "chatroom_created")]
    ChatroomCreated { chatroom: Chatroom },

    #[serde(rename = "chatroom_deleted")]
    ChatroomDeleted { chatroom: Chatroom },

    #[serde(rename = "message_created")]
    MessageCreated { message: ChatMessage },

    #[serde(rename = "message_deleted")]
    MessageDeleted { message: ChatMessage },
}

impl MutationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserCreated { .. } => "user_created",
            Self::UserUpdated { .. } => "user_updated",
            Self::UserDeleted { .. } => "user_deleted",
            Self::ChatroomCreated { .. } => "chatroom_created",
            Self::ChatroomDeleted { .. } => "chatroom_deleted",
            Self::MessageCreated { .. } => "message_created",
            Self::MessageDeleted { .. } => "message_deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChatroomId;

    #[test]
    fn event_type_matches_serde_tag() {
        let evt = MutationEvent::ChatroomCreated {
            chatroom: Chatroom {
                id: ChatroomId::new(),
                topic: "rust".into(),
                owner_username: "alice".into(),
            },
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], evt.event_type());
    }

    #[test]
    fn user_deleted_type() {
        let evt = MutationEvent::UserDeleted {
            username: "bob".into(),
        };
        assert_eq!(evt.event_type(), "user_deleted");
    }
}
