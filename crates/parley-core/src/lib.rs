pub mod errors;
pub mod events;
pub mod ids;
pub mod model;
pub mod security;
pub mod topic;
pub mod validation;

pub use errors::TopicError;
pub use events::MutationEvent;
pub use topic::TopicPath;
