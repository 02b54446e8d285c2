//! Utility modules for the offload engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{OffloadError, Result};
