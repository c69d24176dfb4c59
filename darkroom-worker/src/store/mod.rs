//! Job record store
//!
//! The store holds one serialized record per job-id plus one ordered list of
//! pending job-ids per job type. It knows nothing about job semantics; the
//! queue layer decides what a valid update is and expresses it as a
//! compare-and-swap.
//!
//! All stores are trait-based so the queue can run against Redis in
//! production and against memory in tests.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Name of the hash holding every job record
pub const STATUS_HASH: &str = "job_statuses";

/// Result of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record matched and was replaced
    Swapped,
    /// The record changed since it was read
    Conflict,
    /// There is no record for this id
    Missing,
}

/// Store trait for job records and pending lists
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores a record and appends its id to `queue` in one atomic step
    async fn insert_and_push(&self, job_id: &str, record: &str, queue: &str)
    -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<String>, StoreError>;

    async fn all(&self) -> Result<Vec<String>, StoreError>;

    /// Replaces the record only if it still equals `expected`
    ///
    /// With `requeue` set, the id is appended to that list in the same
    /// atomic step as the write.
    async fn compare_and_swap(
        &self,
        job_id: &str,
        expected: &str,
        new: &str,
        requeue: Option<&str>,
    ) -> Result<CasOutcome, StoreError>;

    /// Deletes the record and every occurrence of the id in `queues`
    ///
    /// Returns whether a record existed.
    async fn remove(&self, job_id: &str, queues: &[&str]) -> Result<bool, StoreError>;

    /// Pops the oldest id of `queue`, waiting up to `timeout` for one to arrive
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn len(&self, queue: &str) -> Result<usize, StoreError>;

    /// Drops every record and the given lists, returning the number of records removed
    async fn clear(&self, queues: &[&str]) -> Result<usize, StoreError>;
}
