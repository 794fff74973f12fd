//! # hooktrace-core
//!
//! Core library for hooktrace - live tracing of AI coding-agent activity.
//!
//! This library provides:
//! - The canonical event model and the normalizer that maps arbitrary
//!   producer payloads onto it
//! - The trace store: the correlation engine owning runs, agents and spans
//! - The trace tree builder and validator
//! - The append-only per-run trace log with startup replay
//! - The update broadcaster for real-time observers
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows one way:
//!
//! ```text
//! producer payload → normalize → TraceStore::apply ─┬─► TraceLog (append)
//!                                                   └─► Broadcaster (deltas)
//! ```
//!
//! The tree builder is invoked on demand against store query output.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hooktrace_core::{normalize, Config, TraceStore};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut store = TraceStore::new(chrono::Duration::minutes(
//!     config.retention.run_ttl_minutes as i64,
//! ));
//!
//! let payload = serde_json::json!({"kind": "sessionStart", "sessionId": "run-1"});
//! if let Some(event) = normalize::normalize(&payload) {
//!     let applied = store.apply(&event);
//!     assert_eq!(applied.updates.len(), 2);
//! }
//! ```

// Re-export commonly used items at the crate root
pub use broadcast::Broadcaster;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventKind, HookEvent};
pub use persist::{TraceLog, TraceRecord};
pub use store::{Applied, TraceStore};
pub use types::*;

// Public modules
pub mod broadcast;
pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod logging;
pub mod normalize;
pub mod persist;
pub mod store;
pub mod tree;
