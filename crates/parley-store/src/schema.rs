/// SQL DDL for the parley-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    api_key TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chatrooms (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL UNIQUE,
    owner_username TEXT NOT NULL REFERENCES users(username)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL REFERENCES users(username),
    chatroom_id TEXT NOT NULL REFERENCES chatrooms(id),
    content TEXT NOT NULL,
    creation_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chatrooms_owner ON chatrooms(owner_username);
CREATE INDEX IF NOT EXISTS idx_messages_chatroom ON messages(chatroom_id, creation_time);
CREATE INDEX IF NOT EXISTS idx_messages_username ON messages(username, creation_time);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
