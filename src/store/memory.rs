//! In-memory record store.

use crate::constants::MILLIS_PER_DAY;
use crate::error::{Result, ThreadError};
use crate::record::{current_timestamp_millis, BoardId, Record, RecordId};
use crate::store::{RecordStore, StreamControl};
use crate::sync::{acquire_read, acquire_write};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::trace;

/// Record store keeping every board in a `HashMap`.
///
/// The clock used for window cutoffs can be pinned with [`set_now`](Self::set_now),
/// and failures can be injected to exercise recovery paths of callers.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    boards: RwLock<HashMap<BoardId, Vec<Record>>>,
    /// Pinned clock in milliseconds; 0 follows the system clock.
    now: AtomicU64,
    fetches: AtomicUsize,
    failing_fetches: RwLock<HashSet<RecordId>>,
    stream_fail_after: RwLock<Option<usize>>,
}

impl MemoryRecordStore {
    /// Creates an empty store following the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the clock used to compute window cutoffs.
    pub fn set_now(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        match self.now.load(Ordering::SeqCst) {
            0 => current_timestamp_millis(),
            pinned => pinned,
        }
    }

    /// Adds a record. A record with the same id on the same board is replaced.
    pub fn insert(&self, record: Record) {
        let mut boards = acquire_write(&self.boards);
        let records = boards.entry(record.board.clone()).or_default();
        if let Some(id) = &record.id {
            records.retain(|r| r.id.as_ref() != Some(id));
        }
        records.push(record);
    }

    /// Adds several records.
    pub fn insert_all(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Returns a copy of a stored record.
    pub fn get(&self, board: &BoardId, id: &RecordId) -> Option<Record> {
        acquire_read(&self.boards)
            .get(board)?
            .iter()
            .find(|r| r.id.as_ref() == Some(id))
            .cloned()
    }

    /// Returns the number of records stored for a board.
    pub fn len(&self, board: &BoardId) -> usize {
        acquire_read(&self.boards).get(board).map_or(0, Vec::len)
    }

    /// Returns true if no board holds any record.
    pub fn is_empty(&self) -> bool {
        acquire_read(&self.boards).values().all(Vec::is_empty)
    }

    /// Returns the number of `fetch_by_id` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes `fetch_by_id` fail for the given id.
    pub fn fail_fetch(&self, id: impl Into<RecordId>) {
        acquire_write(&self.failing_fetches).insert(id.into());
    }

    /// Makes `stream_window` fail after delivering `count` records.
    pub fn fail_stream_after(&self, count: Option<usize>) {
        *acquire_write(&self.stream_fail_after) = count;
    }
}

impl RecordStore for MemoryRecordStore {
    fn stream_window(
        &self,
        board: &BoardId,
        max_age_days: u32,
        sink: &mut dyn FnMut(Record) -> StreamControl,
    ) -> Result<()> {
        let cutoff = self
            .now()
            .saturating_sub(u64::from(max_age_days) * MILLIS_PER_DAY);

        // Snapshot so the callback runs without holding the lock
        let window: Vec<Record> = acquire_read(&self.boards)
            .get(board)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let fail_after = *acquire_read(&self.stream_fail_after);

        trace!("Streaming {} records of board {}", window.len(), board);
        for (delivered, record) in window.into_iter().enumerate() {
            if fail_after == Some(delivered) {
                return Err(ThreadError::store(format!(
                    "stream of board {} interrupted after {} records",
                    board, delivered
                )));
            }
            if sink(record) == StreamControl::Stop {
                break;
            }
        }
        Ok(())
    }

    fn fetch_by_id(&self, board: &BoardId, id: &RecordId) -> Result<Option<Record>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if acquire_read(&self.failing_fetches).contains(id) {
            return Err(ThreadError::store(format!("failed to load record {}", id)));
        }
        Ok(self.get(board, id))
    }

    fn clear_read(&self, board: &BoardId, ids: &[RecordId]) -> Result<()> {
        let ids: HashSet<&RecordId> = ids.iter().collect();
        let mut boards = acquire_write(&self.boards);
        if let Some(records) = boards.get_mut(board) {
            for record in records.iter_mut() {
                if record.id.as_ref().is_some_and(|id| ids.contains(id)) {
                    record.is_new = false;
                }
            }
        }
        Ok(())
    }
}
