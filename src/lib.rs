//! # PQPGP Threads - threaded board views over flat records
//!
//! Records on a board are stored independently and reference their
//! ancestors by id. This library turns a window of such records into a
//! reply tree and keeps it current as records arrive, filters change and
//! the user switches boards.
//!
//! ## Components
//!
//! - **Filter policy** ([`filter`]): decides per record whether it is hidden
//! - **Thread builder** ([`thread::builder`]): full reconstruction with
//!   placeholders for missing ancestors and cascading pruning
//! - **Incremental merge** ([`thread::merge`]): folds one new record into an
//!   existing tree
//! - **Update scheduler** ([`scheduler`]): one rebuild at a time, newest
//!   request wins, superseded results are never delivered
//! - **Engine** ([`engine`]): per-board state and the public entry points
//!
//! ## Example
//!
//! ```rust,no_run
//! use pqpgp_threads::{
//!     EngineConfig, MemoryRecordStore, NoopListener, RebuildRequest, Record, ThreadEngine,
//!     Window,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryRecordStore::new());
//! store.insert(Record::new("news", "m1", &[]));
//! store.insert(Record::new("news", "m2", &["m1"]));
//!
//! let engine = ThreadEngine::new(EngineConfig::default(), store, Arc::new(NoopListener))?;
//! engine.request_rebuild(RebuildRequest::new("news", Window::days(5)));
//! engine.wait_idle(Duration::from_secs(5));
//!
//! let tree = engine.tree(&"news".into()).expect("board was built");
//! assert_eq!(tree.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod filter;
pub mod record;
pub mod scheduler;
pub mod store;
mod sync;
pub mod thread;

pub use board::{BoardRegistry, BoardState};
pub use config::EngineConfig;
pub use engine::{MergeOutcome, NoopListener, ThreadEngine, ThreadListener, TreeReady};
pub use error::{Result, ThreadError};
pub use filter::{is_blocked, BlockReason, FilterConfig, FilterPolicy, KeywordRule};
pub use record::{BoardId, Record, RecordId, Sender, TrustLevel};
pub use scheduler::{
    CancellationToken, RebuildRequest, RebuildTask, RequestOutcome, SchedulerStatus,
    UpdateScheduler, Window,
};
pub use store::{MemoryRecordStore, RecordStore, StreamControl};
pub use thread::{
    build_tree, merge_record, BuildOutput, BuildReport, MergePlacement, MergeResult, NodeContent,
    NodeId, Placeholder, ThreadBuilder, ThreadStats, ThreadTree,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
