pub mod commands;
pub mod connection;
pub mod data;
pub mod dispatcher;
pub mod event_bridge;
pub mod frame;
pub mod rest;
pub mod server;
pub mod settings;
pub mod topics;

pub use server::{build_router, start, AppState, ServerHandle};
pub use settings::{load_settings, load_settings_from_path, Settings};
