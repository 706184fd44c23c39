//! Record store boundary.
//!
//! Durable storage is owned elsewhere; the thread builder only needs three
//! operations from it, captured by [`RecordStore`]:
//!
//! - `stream_window`: push every record of a board newer than a cutoff into a
//!   callback, which can stop the stream early
//! - `fetch_by_id`: load one record regardless of its age
//! - `clear_read`: persist the read state of records
//!
//! [`MemoryRecordStore`] is an in-process implementation used by tests,
//! benchmarks and embedders that keep records in memory.

mod memory;

pub use memory::MemoryRecordStore;

use crate::error::Result;
use crate::record::{BoardId, Record, RecordId};

/// Answer of a stream callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Deliver the next record.
    Continue,
    /// Stop streaming; the store returns `Ok(())`.
    Stop,
}

/// Access to stored records of all boards.
pub trait RecordStore: Send + Sync {
    /// Streams the records of `board` that are at most `max_age_days` old.
    ///
    /// An error may be returned after some records were already delivered.
    fn stream_window(
        &self,
        board: &BoardId,
        max_age_days: u32,
        sink: &mut dyn FnMut(Record) -> StreamControl,
    ) -> Result<()>;

    /// Loads a single record of `board` by id.
    fn fetch_by_id(&self, board: &BoardId, id: &RecordId) -> Result<Option<Record>>;

    /// Marks the given records of `board` as read.
    fn clear_read(&self, board: &BoardId, ids: &[RecordId]) -> Result<()>;
}
