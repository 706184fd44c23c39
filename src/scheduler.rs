//! Single-flight rebuild scheduling.
//!
//! At most one rebuild runs at any time across all boards. A background
//! worker thread executes rebuilds through a [`RebuildTask`]; requests from
//! other threads move the scheduler between three states:
//!
//! ```text
//! Idle --request(X)--> Running(X)
//! Running(X) --request(X)--> Running(X)             (ignored)
//! Running(X) --request(Y)--> Running(X) + Queued(Y)  (X cancelled)
//! Running(X) + Queued(Y) --request(Z)--> Running(X) + Queued(Z)
//! Running(X) --finish--> Running(queued) or Idle
//! ```
//!
//! Cancellation is cooperative: the task polls its [`CancellationToken`]
//! between passes. A run whose token was cancelled never reaches
//! [`RebuildTask::deliver`], so superseded results are never handed out.
//! Whether a run is delivered is decided under the state lock, which keeps
//! deliveries in request order.

use crate::constants::{DEFAULT_MAX_AGE_DAYS, MAX_WINDOW_AGE_DAYS};
use crate::error::{Result, ThreadError};
use crate::record::{BoardId, RecordId};
use crate::sync::acquire;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared flag telling a running rebuild to stop at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(ThreadError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ThreadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Age window of the records a rebuild loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Oldest record age included, in days.
    pub max_age_days: u32,
}

impl Window {
    /// Creates a window covering the last `max_age_days` days.
    pub fn days(max_age_days: u32) -> Self {
        Self {
            max_age_days: max_age_days.min(MAX_WINDOW_AGE_DAYS),
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::days(DEFAULT_MAX_AGE_DAYS)
    }
}

/// A request to rebuild one board's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildRequest {
    /// Board to rebuild.
    pub board: BoardId,
    /// Records to load.
    pub window: Window,
    /// Record selected before the rebuild, restored afterwards if it survives.
    pub prior_selection: Option<RecordId>,
}

impl RebuildRequest {
    /// Creates a request with no prior selection.
    pub fn new(board: impl Into<BoardId>, window: Window) -> Self {
        Self {
            board: board.into(),
            window,
            prior_selection: None,
        }
    }

    /// Sets the record to reselect after the rebuild.
    pub fn with_selection(mut self, id: impl Into<RecordId>) -> Self {
        self.prior_selection = Some(id.into());
        self
    }
}

/// Work executed by the scheduler's worker thread.
pub trait RebuildTask: Send + Sync + 'static {
    /// Result of a finished rebuild.
    type Output: Send + 'static;

    /// Runs a rebuild. Should return `Err(ThreadError::Cancelled)` promptly
    /// once `token` is cancelled.
    fn build(&self, request: &RebuildRequest, token: &CancellationToken) -> Result<Self::Output>;

    /// Hands a finished, non-superseded result to its consumer.
    fn deliver(&self, request: RebuildRequest, output: Self::Output);

    /// Called instead of [`RebuildTask::deliver`] when a run ends without a
    /// result (superseded, failed or panicked) and no queued run of the same
    /// board takes over.
    fn discard(&self, _request: RebuildRequest) {}
}

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Nothing running or queued.
    Idle,
    /// A rebuild is running for the board.
    Running(BoardId),
    /// A rebuild is running (or winding down) and another one waits.
    Queued {
        /// Board of the running rebuild.
        running: BoardId,
        /// Board of the waiting request.
        queued: BoardId,
    },
}

/// Outcome of [`UpdateScheduler::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The rebuild starts right away.
    Started,
    /// A rebuild for the same board is already in progress.
    AlreadyRunning,
    /// The request waits for the running rebuild to finish or unwind.
    Queued,
    /// The scheduler was shut down.
    Rejected,
}

#[derive(Debug)]
struct ActiveRun {
    request: RebuildRequest,
    token: CancellationToken,
    started: bool,
    committed: bool,
}

impl ActiveRun {
    fn new(request: RebuildRequest) -> Self {
        Self {
            request,
            token: CancellationToken::new(),
            started: false,
            committed: false,
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: Option<ActiveRun>,
    queued: Option<RebuildRequest>,
    shutdown: bool,
    finished_runs: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

/// Process-wide single-flight scheduler for rebuilds.
#[derive(Debug)]
pub struct UpdateScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateScheduler {
    /// Spawns the worker thread executing rebuilds with `task`.
    pub fn start<T: RebuildTask>(task: Arc<T>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("thread-rebuild".to_string())
            .spawn(move || run_worker(worker_shared, task))
            .map_err(|e| ThreadError::scheduler(format!("failed to spawn worker: {}", e)))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Requests a rebuild, superseding any run for another board.
    pub fn request(&self, request: RebuildRequest) -> RequestOutcome {
        self.submit(request, false)
    }

    /// Requests a rebuild whose inputs changed since any run in progress
    /// started. A live run of the same board is cancelled and the request
    /// queued behind it.
    pub fn restart(&self, request: RebuildRequest) -> RequestOutcome {
        self.submit(request, true)
    }

    fn submit(&self, request: RebuildRequest, restart: bool) -> RequestOutcome {
        let mut state = acquire(&self.shared.state);
        if state.shutdown {
            warn!("Rebuild of {} requested after shutdown", request.board);
            return RequestOutcome::Rejected;
        }

        let outcome = match state.running.as_mut() {
            None => {
                debug!("Starting rebuild of {}", request.board);
                state.running = Some(ActiveRun::new(request));
                RequestOutcome::Started
            }
            Some(run)
                if !restart
                    && run.request.board == request.board
                    && !run.token.is_cancelled()
                    && !run.committed =>
            {
                debug!("Rebuild of {} already in progress", request.board);
                RequestOutcome::AlreadyRunning
            }
            Some(run) => {
                if !run.committed {
                    debug!(
                        "Rebuild of {} superseded by {}",
                        run.request.board, request.board
                    );
                    run.token.cancel();
                }
                if let Some(dropped) = state.queued.replace(request) {
                    debug!("Queued rebuild of {} replaced", dropped.board);
                }
                RequestOutcome::Queued
            }
        };

        self.shared.changed.notify_all();
        outcome
    }

    /// Returns the current state.
    pub fn status(&self) -> SchedulerStatus {
        let state = acquire(&self.shared.state);
        match (&state.running, &state.queued) {
            (None, None) => SchedulerStatus::Idle,
            (Some(run), None) => SchedulerStatus::Running(run.request.board.clone()),
            (Some(run), Some(queued)) => SchedulerStatus::Queued {
                running: run.request.board.clone(),
                queued: queued.board.clone(),
            },
            // The worker promotes the queued request as soon as a run ends
            (None, Some(queued)) => SchedulerStatus::Running(queued.board.clone()),
        }
    }

    /// Returns true while a rebuild is running or queued.
    pub fn is_busy(&self) -> bool {
        let state = acquire(&self.shared.state);
        state.running.is_some() || state.queued.is_some()
    }

    /// Returns true if a live (not superseded) or queued rebuild targets `board`.
    pub fn is_active_for(&self, board: &BoardId) -> bool {
        let state = acquire(&self.shared.state);
        let running = state
            .running
            .as_ref()
            .is_some_and(|run| &run.request.board == board && !run.token.is_cancelled());
        let queued = state.queued.as_ref().is_some_and(|q| &q.board == board);
        running || queued
    }

    /// Returns the newest pending request for `board`: the queued one, or
    /// the live run.
    pub fn active_request(&self, board: &BoardId) -> Option<RebuildRequest> {
        let state = acquire(&self.shared.state);
        if let Some(queued) = state.queued.as_ref().filter(|q| &q.board == board) {
            return Some(queued.clone());
        }
        state
            .running
            .as_ref()
            .filter(|run| &run.request.board == board && !run.token.is_cancelled())
            .map(|run| run.request.clone())
    }

    /// Returns the number of runs that have ended, delivered or not.
    pub fn finished_runs(&self) -> u64 {
        acquire(&self.shared.state).finished_runs
    }

    /// Blocks until nothing is running or queued, or the timeout elapses.
    ///
    /// Returns true if the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = acquire(&self.shared.state);
        while state.running.is_some() || state.queued.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Cancels the running rebuild, drops the queued one and joins the worker.
    pub fn shutdown(&self) {
        {
            let mut state = acquire(&self.shared.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queued = None;
            if let Some(run) = &state.running {
                run.token.cancel();
            }
            self.shared.changed.notify_all();
        }

        if let Some(handle) = acquire(&self.worker).take() {
            if handle.join().is_err() {
                error!("Rebuild worker panicked during shutdown");
            }
        }
        info!("Rebuild scheduler stopped");
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T: RebuildTask>(shared: Arc<Shared>, task: Arc<T>) {
    loop {
        let (request, token) = {
            let mut state = acquire(&shared.state);
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(run) = state.running.as_mut() {
                    if !run.started {
                        run.started = true;
                        break (run.request.clone(), run.token.clone());
                    }
                }
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner());
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| task.build(&request, &token)));

        // Commit under the lock so a concurrent request either cancels the
        // run before this point or finds it committed
        let output = {
            let mut state = acquire(&shared.state);
            match result {
                Ok(Ok(output)) if !token.is_cancelled() => {
                    if let Some(run) = state.running.as_mut() {
                        run.committed = true;
                    }
                    Some(output)
                }
                Ok(Ok(_)) | Ok(Err(ThreadError::Cancelled)) => {
                    debug!("Discarding superseded rebuild of {}", request.board);
                    None
                }
                Ok(Err(e)) => {
                    warn!("Rebuild of {} failed: {}", request.board, e);
                    None
                }
                Err(_) => {
                    error!("Rebuild of {} panicked", request.board);
                    None
                }
            }
        };

        match output {
            Some(output) => task.deliver(request, output),
            None => {
                // A queued run of the same board takes over what this one left
                let handoff = acquire(&shared.state)
                    .queued
                    .as_ref()
                    .is_some_and(|q| q.board == request.board);
                if !handoff {
                    task.discard(request);
                }
            }
        }

        let mut state = acquire(&shared.state);
        state.finished_runs += 1;
        state.running = if state.shutdown {
            None
        } else {
            state.queued.take().map(ActiveRun::new)
        };
        shared.changed.notify_all();
    }
}
