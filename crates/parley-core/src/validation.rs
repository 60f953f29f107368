//! Field-level input predicates.
//!
//! Every check is a pure `fn(&str) -> bool`.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_USERNAME_LEN: usize = 255;
pub const MAX_TOPIC_LEN: usize = 255;
pub const MAX_CONTENT_LEN: usize = 65_535;
pub const MAX_DESCRIPTION_LEN: usize = 65_535;

static ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("static regex"));
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("static regex")
});
static HEX_64: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("static regex"));
static PASSWORD_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{8,60}$").expect("static regex"));

/// Non-empty, alphanumeric, at most 255 chars.
pub fn is_username(value: &str) -> bool {
    value.len() <= MAX_USERNAME_LEN && ALPHANUMERIC.is_match(value)
}

/// Hyphenated UUID of any version.
pub fn is_uuid(value: &str) -> bool {
    UUID.is_match(value)
}

/// Lowercase hex SHA-256 digest, the shape produced by [`crate::security::derive_api_key`].
pub fn is_credential(value: &str) -> bool {
    HEX_64.is_match(value)
}

/// 8-60 letters and digits with at least one of each.
pub fn is_password(value: &str) -> bool {
    PASSWORD_CHARS.is_match(value)
        && value.chars().any(|c| c.is_ascii_alphabetic())
        && value.chars().any(|c| c.is_ascii_digit())
}

pub fn is_content(value: &str) -> bool {
    value.chars().count() < MAX_CONTENT_LEN
}

/// Free-form profile text, possibly empty.
pub fn is_description(value: &str) -> bool {
    value.chars().count() <= MAX_DESCRIPTION_LEN
}

/// Chat-room topic (the human title, not a subscription path).
pub fn is_chatroom_topic(value: &str) -> bool {
    !value.is_empty() && value.chars().count() <= MAX_TOPIC_LEN
}

/// Anything that can narrow a subscription: a username or an entity id.
pub fn is_identifier(value: &str) -> bool {
    is_username(value) || is_uuid(value)
}
