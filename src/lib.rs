pub mod bot;
pub mod classify;
pub mod config;
pub mod http_client;
pub mod inbox;
pub mod ingest;
pub mod messages;
pub mod platform;
pub mod recheck;
pub mod store;
pub mod throttle;

#[cfg(test)]
pub mod testing;

pub use classify::{FeatureFlags, RuleSet};
pub use config::Config;
pub use messages::{determine, MessageBuilder, MessageKind};
pub use platform::{Document, InboxItem, Platform, PlatformError};
pub use recheck::Reconciler;
pub use store::{Record, RecordStore, SqliteStore};
