//! Backup Engine Library
//!
//! Verified full and incremental backups of a small self-hosted application
//! (SQLite store, uploaded assets, config files), replicated to remote
//! destinations, pruned by retention and restored with a safety net.

pub mod archiver;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod integrity;
pub mod live;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod restore;
pub mod retention;
pub mod storage;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::EngineConfig;
pub use orchestrator::{Engine, RunOutcome, RunResult};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
