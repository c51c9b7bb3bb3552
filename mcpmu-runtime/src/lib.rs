//! Aggregation runtime for the mcpmu gateway
//!
//! Ties the other crates together:
//!
//! - [`context`]: the runtime context owning the config store, event bus,
//!   tool cache, credential store, and supervisor; no globals cross module
//!   boundaries
//! - [`supervisor`]: one actor task per downstream server running the
//!   lifecycle state machine (start, ready, crash-restart with backoff,
//!   graceful stop)
//! - [`aggregator`]: the router that unions member tool lists under
//!   qualified names and dispatches `tools/call` with namespace permission
//!   enforcement
//! - [`reload`]: the config-file watcher that diffs a reloaded document
//!   against running state and applies the minimum set of restarts

pub mod aggregator;
pub mod context;
pub mod error;
pub mod reload;
pub mod supervisor;

pub use aggregator::Aggregator;
pub use context::RuntimeContext;
pub use error::{RuntimeError, RuntimeResult};
pub use reload::ConfigWatcher;
pub use supervisor::{ExitInfo, ServerStatus, Supervisor};
