//! The engine ties boards, the scheduler and the record store together.
//!
//! Inbound calls come from any thread:
//!
//! - [`ThreadEngine::request_rebuild`] hands a board to the single-flight
//!   scheduler; the newest request always wins.
//! - [`ThreadEngine::merge_new_record`] folds a fresh record into the board's
//!   current tree. While a rebuild of that board is active the record waits
//!   in the board's deferred queue and is folded into the rebuilt tree, or
//!   into the old one if the rebuild is discarded.
//! - [`ThreadEngine::clear_read_state`] and
//!   [`ThreadEngine::update_filter_config`] change a board's state.
//!
//! Outbound, a [`ThreadListener`] receives every delivered tree exactly once
//! and every applied merge.

use crate::board::{BoardRegistry, BoardState, SharedBoardState};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::filter::{FilterConfig, FilterPolicy};
use crate::record::{BoardId, Record, RecordId};
use crate::scheduler::{
    CancellationToken, RebuildRequest, RebuildTask, RequestOutcome, SchedulerStatus,
    UpdateScheduler,
};
use crate::store::RecordStore;
use crate::sync::acquire;
use crate::thread::{
    merge_record, BuildOutput, BuildReport, MergePlacement, NodeId, ThreadBuilder, ThreadStats,
    ThreadTree,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A finished rebuild handed to the listener.
#[derive(Debug, Clone)]
pub struct TreeReady {
    /// Board the tree belongs to.
    pub board: BoardId,
    /// Id of this rebuild, to be passed to [`ThreadEngine::acknowledge_tree`].
    pub build_id: u64,
    /// The finished tree.
    pub tree: Arc<ThreadTree>,
    /// Counters over the tree.
    pub stats: ThreadStats,
    /// Node of the prior selection, if it survived.
    pub selection: Option<NodeId>,
    /// What the build did.
    pub report: BuildReport,
}

/// Consumer of engine output.
pub trait ThreadListener: Send + Sync {
    /// Called once per delivered rebuild, on the scheduler's worker thread.
    fn on_tree_ready(&self, ready: &TreeReady);

    /// Called after a merge inserted a record.
    fn on_merge_applied(&self, _board: &BoardId, _placement: &MergePlacement) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ThreadListener for NoopListener {
    fn on_tree_ready(&self, _ready: &TreeReady) {}
}

/// Result of [`ThreadEngine::merge_new_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge ran; the placement says what happened to the record.
    Merged(MergePlacement),
    /// A rebuild of the board is running or queued; the record is merged
    /// once it ends.
    Deferred,
    /// The board has no tree yet.
    NoTree,
}

struct EngineCore {
    config: EngineConfig,
    store: Arc<dyn RecordStore>,
    boards: BoardRegistry,
    listener: Arc<dyn ThreadListener>,
    next_build_id: AtomicU64,
}

impl EngineCore {
    fn board(&self, board: &BoardId) -> SharedBoardState {
        self.boards
            .get_or_insert_with(board, || self.config.filter_for(board))
    }

    fn policy(&self, state: &BoardState) -> FilterPolicy {
        self.config.policy(state.filter.clone())
    }

    fn clear_in_store(&self, board: &BoardId, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.clear_read(board, ids) {
            warn!(
                "Failed to clear read state of {} records in {}: {}",
                ids.len(),
                board,
                e
            );
        }
    }

    /// Merges a record into the board's live tree. Returns `None` if the
    /// board has no tree.
    fn merge_locked(
        &self,
        board: &BoardId,
        state: &mut BoardState,
        record: Record,
    ) -> Option<MergePlacement> {
        let policy = self.policy(state);
        let threading = self.config.threading_enabled;
        let counted = record.clone();

        let tree = state.tree_mut()?;
        let result = merge_record(tree, record, &policy, threading);

        if result.placement.is_applied() {
            state.note_merged(&counted);
        }
        if let Some(id) = result.read_clear {
            self.clear_in_store(board, &[id]);
        }
        debug!("Merge into {}: {}", board, result.placement);
        Some(result.placement)
    }
}

impl RebuildTask for EngineCore {
    type Output = BuildOutput;

    fn build(&self, request: &RebuildRequest, token: &CancellationToken) -> Result<BuildOutput> {
        // A filter change after this snapshot restarts the rebuild
        let policy = self.policy(&acquire(&self.board(&request.board)));
        debug!(
            "Rebuilding {} over {} days",
            request.board, request.window.max_age_days
        );
        ThreadBuilder::new(self.store.as_ref(), &policy)
            .threading(self.config.threading_enabled)
            .cancellation(token.clone())
            .build(request)
    }

    fn deliver(&self, request: RebuildRequest, output: BuildOutput) {
        let BuildOutput {
            mut tree,
            stats,
            selection,
            read_clears,
            report,
        } = output;
        let build_id = self.next_build_id.fetch_add(1, Ordering::SeqCst) + 1;
        tree.set_build_id(build_id);

        let (tree, stats) = {
            let slot = self.board(&request.board);
            let mut state = acquire(&slot);

            // Records that arrived during the rebuild; those the build already
            // streamed come back as duplicates
            let deferred = state.take_deferred();
            let mut read_clears = read_clears;
            let mut stats = stats;
            if !deferred.is_empty() {
                let policy = self.policy(&state);
                let threading = self.config.threading_enabled;
                let count = deferred.len();
                for record in deferred {
                    let result = merge_record(&mut tree, record, &policy, threading);
                    read_clears.extend(result.read_clear);
                }
                stats = tree.stats();
                debug!("Folded {} deferred records into {}", count, request.board);
            }

            let tree = Arc::new(tree);
            self.clear_in_store(&request.board, &read_clears);
            state.install(Arc::clone(&tree), &stats, request.window);
            (tree, stats)
        };

        info!(
            "Board {} rebuilt (build {}): {} records, {} unread",
            request.board, build_id, stats.records, stats.unread
        );
        self.listener.on_tree_ready(&TreeReady {
            board: request.board,
            build_id,
            tree,
            stats,
            selection,
            report,
        });
    }

    fn discard(&self, request: RebuildRequest) {
        let Some(slot) = self.boards.get(&request.board) else {
            return;
        };
        let applied: Vec<MergePlacement> = {
            let mut state = acquire(&slot);
            let deferred = state.take_deferred();
            if deferred.is_empty() {
                return;
            }
            if !state.has_tree() {
                // The next rebuild reads them from the store
                debug!(
                    "Dropping {} deferred records of unbuilt board {}",
                    deferred.len(),
                    request.board
                );
                return;
            }
            let applied = deferred
                .into_iter()
                .filter_map(|record| self.merge_locked(&request.board, &mut state, record))
                .filter(MergePlacement::is_applied)
                .collect();
            applied
        };

        for placement in &applied {
            self.listener.on_merge_applied(&request.board, placement);
        }
    }
}

/// Thread reconstruction engine for all boards.
pub struct ThreadEngine {
    core: Arc<EngineCore>,
    scheduler: UpdateScheduler,
}

impl ThreadEngine {
    /// Validates `config` and starts the rebuild worker.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        listener: Arc<dyn ThreadListener>,
    ) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(EngineCore {
            config,
            store,
            boards: BoardRegistry::new(),
            listener,
            next_build_id: AtomicU64::new(0),
        });
        let scheduler = UpdateScheduler::start(Arc::clone(&core))?;
        Ok(Self { core, scheduler })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Requests a rebuild of a board.
    pub fn request_rebuild(&self, request: RebuildRequest) -> RequestOutcome {
        self.core.board(&request.board);
        self.scheduler.request(request)
    }

    /// Rebuilds a board with its last window, or the default window if it
    /// was never built.
    pub fn refresh(&self, board: &BoardId) -> RequestOutcome {
        let window = acquire(&self.core.board(board))
            .window
            .unwrap_or_else(|| self.core.config.default_window());
        self.request_rebuild(RebuildRequest::new(board.clone(), window))
    }

    /// Folds a newly arrived record into a board's tree.
    ///
    /// While a rebuild of the board is running or queued, the record is held
    /// and merged when that rebuild ends.
    pub fn merge_new_record(&self, board: &BoardId, record: Record) -> MergeOutcome {
        let Some(slot) = self.core.boards.get(board) else {
            return MergeOutcome::NoTree;
        };

        let mut placements = {
            let mut state = acquire(&slot);
            // Checked under the board lock so delivery cannot slip in between
            if self.scheduler.is_active_for(board) {
                debug!("Deferring merge into {} to the active rebuild", board);
                state.defer(record);
                return MergeOutcome::Deferred;
            }

            // Left behind by a superseded request of this board
            let mut records = state.take_deferred();
            records.push(record);
            let mut placements = Vec::with_capacity(records.len());
            for record in records {
                match self.core.merge_locked(board, &mut state, record) {
                    Some(placement) => placements.push(placement),
                    None => return MergeOutcome::NoTree,
                }
            }
            placements
        };

        for placement in placements.iter().filter(|p| p.is_applied()) {
            self.core.listener.on_merge_applied(board, placement);
        }
        placements
            .pop()
            .map_or(MergeOutcome::NoTree, MergeOutcome::Merged)
    }

    /// Marks records as read in the store and in the board's tree.
    ///
    /// Returns the number of tree records that changed from unread to read.
    pub fn clear_read_state(&self, board: &BoardId, ids: &[RecordId]) -> Result<usize> {
        let slot = self.core.board(board);
        let mut state = acquire(&slot);
        self.core.store.clear_read(board, ids)?;

        let unread: Vec<NodeId> = match state.tree() {
            Some(tree) => ids
                .iter()
                .filter_map(|id| tree.find_record(id))
                .filter(|node| tree.record(*node).is_some_and(|r| r.is_new))
                .collect(),
            None => Vec::new(),
        };
        if unread.is_empty() {
            return Ok(0);
        }

        if let Some(tree) = state.tree_mut() {
            for node in &unread {
                if let Some(record) = tree.record_mut(*node) {
                    record.is_new = false;
                }
            }
            tree.bump_version();
        }
        state.recount();
        Ok(unread.len())
    }

    /// Replaces a board's filter configuration.
    ///
    /// A rebuild of the board that is already in progress is restarted with
    /// the new filter. Otherwise a board that has a tree is rebuilt with its
    /// last window. The outcome of that request is returned.
    pub fn update_filter_config(
        &self,
        board: &BoardId,
        config: FilterConfig,
    ) -> Option<RequestOutcome> {
        let request = {
            let slot = self.core.board(board);
            let mut state = acquire(&slot);
            state.filter = config;
            let last_window = state.window.filter(|_| state.has_tree());
            self.scheduler
                .active_request(board)
                .or_else(|| last_window.map(|window| RebuildRequest::new(board.clone(), window)))
        };
        request.map(|request| {
            debug!("Filter of {} changed, rebuilding", board);
            self.scheduler.restart(request)
        })
    }

    /// Records that the consumer applied build `build_id` of a board.
    ///
    /// Returns false if the id is stale or unknown.
    pub fn acknowledge_tree(&self, board: &BoardId, build_id: u64) -> bool {
        self.core
            .boards
            .get(board)
            .is_some_and(|slot| acquire(&slot).acknowledge(build_id))
    }

    /// Returns true while a rebuild is running, queued, or delivered but
    /// not yet acknowledged.
    pub fn is_rebuild_active(&self) -> bool {
        self.scheduler.is_busy()
            || self
                .core
                .boards
                .states()
                .iter()
                .any(|slot| acquire(slot).awaiting_ack.is_some())
    }

    /// Returns a copy of a board's state.
    pub fn board_state(&self, board: &BoardId) -> Option<BoardState> {
        self.core.boards.get(board).map(|slot| acquire(&slot).clone())
    }

    /// Returns a board's current tree snapshot.
    pub fn tree(&self, board: &BoardId) -> Option<Arc<ThreadTree>> {
        self.core.boards.get(board).and_then(|slot| acquire(&slot).tree())
    }

    /// Returns all boards the engine has seen.
    pub fn boards(&self) -> Vec<BoardId> {
        self.core.boards.boards()
    }

    /// Returns the scheduler state.
    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Blocks until no rebuild is running or queued.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Stops the rebuild worker. Later rebuild requests are rejected.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
