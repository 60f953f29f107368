/// Why a topic string could not be turned into a [`crate::topic::TopicPath`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("segment {index} is empty")]
    EmptySegment { index: usize },
    #[error("segment contains a separator: {0}")]
    EmbeddedSeparator(String),
}
