use std::fmt;

use crate::errors::TopicError;

pub const SEPARATOR: char = '.';

/// A dot-separated subscription path. The first segment is the root,
/// the rest narrow it (owner, room id, scope).
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TopicPath {
    segments: Vec<String>,
}

impl TopicPath {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        Self::from_segments(raw.split(SEPARATOR).map(str::to_owned).collect())
    }

    pub fn from_segments(segments: Vec<String>) -> Result<Self, TopicError> {
        if segments.is_empty() {
            return Err(TopicError::Empty);
        }
        if let Some(index) = segments.iter().position(String::is_empty) {
            return Err(TopicError::EmptySegment { index });
        }
        if let Some(bad) = segments.iter().find(|s| s.contains(SEPARATOR)) {
            return Err(TopicError::EmbeddedSeparator(bad.clone()));
        }
        Ok(Self { segments })
    }

    /// Root plus params, for building broadcast topics.
    pub fn scoped(root: &str, params: &[&str]) -> Result<Self, TopicError> {
        let mut segments = Vec::with_capacity(params.len() + 1);
        segments.push(root.to_owned());
        segments.extend(params.iter().map(|p| (*p).to_owned()));
        Self::from_segments(segments)
    }

    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn params(&self) -> &[String] {
        &self.segments[1..]
    }

    pub fn canonical(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
