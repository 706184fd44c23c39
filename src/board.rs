//! Per-board state.
//!
//! Every board owns its latest tree snapshot, the counters derived from it
//! and its filter configuration. All paths that change a board (finished
//! rebuilds, merges, read-state clears) go through the board's own mutex, so
//! unrelated boards never contend. Records that arrive while the board is
//! being rebuilt wait in the board's deferred queue until the rebuild ends.

use crate::filter::FilterConfig;
use crate::record::{BoardId, Record};
use crate::scheduler::Window;
use crate::sync::{acquire_read, acquire_write};
use crate::thread::{ThreadStats, ThreadTree};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// State of one board.
#[derive(Debug, Clone, Default)]
pub struct BoardState {
    /// Unread records in the current tree.
    pub unread: usize,
    /// Any record in the current tree is flagged.
    pub has_flagged: bool,
    /// Any record in the current tree is starred.
    pub has_starred: bool,
    /// Id of the rebuild that produced the current tree.
    pub last_build_id: Option<u64>,
    /// Build handed to the consumer but not acknowledged yet.
    pub awaiting_ack: Option<u64>,
    /// Filter configuration of this board.
    pub filter: FilterConfig,
    /// Window of the last rebuild.
    pub window: Option<Window>,
    tree: Option<Arc<ThreadTree>>,
    deferred: Vec<Record>,
}

impl BoardState {
    /// Creates an empty board with the given filter.
    pub fn new(filter: FilterConfig) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Returns the current tree snapshot.
    pub fn tree(&self) -> Option<Arc<ThreadTree>> {
        self.tree.clone()
    }

    /// Returns true once a rebuild has delivered a tree.
    pub fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    /// Gives copy-on-write access to the tree; readers holding the old
    /// snapshot keep seeing it unchanged.
    pub fn tree_mut(&mut self) -> Option<&mut ThreadTree> {
        self.tree.as_mut().map(Arc::make_mut)
    }

    /// Replaces the tree with the result of a rebuild.
    pub fn install(&mut self, tree: Arc<ThreadTree>, stats: &ThreadStats, window: Window) {
        self.last_build_id = Some(tree.build_id());
        self.awaiting_ack = Some(tree.build_id());
        self.window = Some(window);
        self.apply_stats(stats);
        self.tree = Some(tree);
    }

    /// Copies counters from tree statistics.
    pub fn apply_stats(&mut self, stats: &ThreadStats) {
        self.unread = stats.unread;
        self.has_flagged = stats.has_flagged;
        self.has_starred = stats.has_starred;
    }

    /// Recomputes the counters from the current tree.
    pub fn recount(&mut self) {
        let stats = self.tree.as_ref().map(|t| t.stats()).unwrap_or_default();
        self.apply_stats(&stats);
    }

    /// Accounts for a record merged into the tree.
    pub fn note_merged(&mut self, record: &Record) {
        if record.is_new {
            self.unread += 1;
        }
        self.has_flagged |= record.is_flagged;
        self.has_starred |= record.is_starred;
    }

    /// Holds a record that arrived while a rebuild of this board was active.
    pub fn defer(&mut self, record: Record) {
        self.deferred.push(record);
    }

    /// Number of records waiting for the active rebuild.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Takes the deferred records in arrival order.
    pub fn take_deferred(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.deferred)
    }

    /// Clears the pending acknowledgement if it matches `build_id`.
    ///
    /// Returns false for stale or unknown builds.
    pub fn acknowledge(&mut self, build_id: u64) -> bool {
        if self.awaiting_ack == Some(build_id) {
            self.awaiting_ack = None;
            true
        } else {
            false
        }
    }
}

/// Handle to one board's state.
pub type SharedBoardState = Arc<Mutex<BoardState>>;

/// Map of all known boards.
#[derive(Debug, Default)]
pub struct BoardRegistry {
    boards: RwLock<HashMap<BoardId, SharedBoardState>>,
}

impl BoardRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a board's state if it is known.
    pub fn get(&self, board: &BoardId) -> Option<SharedBoardState> {
        acquire_read(&self.boards).get(board).cloned()
    }

    /// Returns a board's state, creating it with `filter` on first use.
    pub fn get_or_insert_with(
        &self,
        board: &BoardId,
        filter: impl FnOnce() -> FilterConfig,
    ) -> SharedBoardState {
        if let Some(state) = self.get(board) {
            return state;
        }
        acquire_write(&self.boards)
            .entry(board.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BoardState::new(filter()))))
            .clone()
    }

    /// Returns the ids of all known boards.
    pub fn boards(&self) -> Vec<BoardId> {
        let mut ids: Vec<BoardId> = acquire_read(&self.boards).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the handles of all known boards.
    pub fn states(&self) -> Vec<SharedBoardState> {
        acquire_read(&self.boards).values().cloned().collect()
    }
}
