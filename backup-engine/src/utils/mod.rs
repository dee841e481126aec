//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;

pub use errors::{EngineError, ErrorReport, Result};
