//! Offload Engine Library
//!
//! Ships backup archives to remote storage providers and keeps a durable
//! queue of remote deletions that is retried until every provider confirms.

pub mod config;
pub mod destinations;
pub mod events;
pub mod host;
pub mod lock;
pub mod manifest;
pub mod purge;
pub mod registry;
pub mod retention;
pub mod signing;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use events::{BroadcastSink, EventSink, OffloadEvent};
pub use host::{Clock, HostStore, MemoryHost, SystemClock};
pub use purge::{PassReport, PurgeWorker, QueueEntry, QueueStatus};
pub use registry::DestinationRegistry;
pub use transfer::Destination;
pub use utils::errors::{OffloadError, Result};
