//! Thread trees and the two ways of producing them.
//!
//! ## Tree shape
//!
//! ```text
//! Root
//!  ├── m1
//!  │    └── m2
//!  │         └── m3
//!  └── [missing1]        (placeholder)
//!       └── m5
//! ```
//!
//! Every record hangs under its nearest ancestor. Ancestors that could not be
//! loaded are represented by placeholders so no reply loses its context, and
//! placeholders (like blocked records) never survive as leaves.
//!
//! - [`builder`] reconstructs a board from scratch out of a record store.
//! - [`merge`] folds a single new record into an existing tree.

pub mod builder;
pub mod merge;
pub mod tree;

pub use builder::{build_tree, BuildOutput, BuildReport, ThreadBuilder};
pub use merge::{merge_record, MergePlacement, MergeResult};
pub use tree::{NodeContent, NodeId, Placeholder, ThreadStats, ThreadTree, TreeNode};
