//! Application configuration and its SQLite-backed store

mod schema;
mod store;

pub use schema::{AppConfig, BroadcasterConfig, WebConfig, WhipConfig};
pub use store::ConfigStore;
