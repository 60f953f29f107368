pub mod chatrooms;
pub mod database;
pub mod error;
pub mod messages;
pub mod schema;
pub mod service;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use service::{ChatService, KeyedUser, ServiceError};
