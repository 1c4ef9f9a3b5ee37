//! The record store contract and its in-memory implementation.
//!
//! A store holds three things: the id counter, id → value records, and the
//! input-pair → id dedup index. Every method may block and must be safe to
//! call from any number of threads at once.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::model::InputPair;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium could not be read or written.
    #[error("store unavailable: {0}")]
    Io(#[from] io::Error),

    #[error("log is corrupt: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,

    /// The store was asked to do something that would break immutability
    /// or dedup consistency.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, StoreError::InvariantViolation(_))
    }
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Outcome of a set-if-absent write to the dedup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupClaim {
    /// This caller wrote the entry and owns the id it offered.
    Claimed,
    /// Another caller got there first; the offered id must be discarded.
    AlreadyClaimed,
}

pub trait RecordStore: Send + Sync {
    /// Atomically increments the counter and returns the new value.
    fn allocate_id(&self) -> StoreResult<u64>;

    /// Stores a record. Fails with `InvariantViolation` if `id` exists.
    fn put_record(&self, id: u64, value: f64) -> StoreResult<()>;

    fn get_record(&self, id: u64) -> StoreResult<Option<f64>>;

    fn get_dedup_id(&self, pair: &InputPair) -> StoreResult<Option<u64>>;

    /// Maps `pair` to `id` only if `pair` has no mapping yet.
    fn put_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<DedupClaim>;

    /// Removes the mapping for `pair` if, and only if, it still points at
    /// `id`. Used to take back a claim whose record could not be written.
    fn release_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<()>;
}

/// Non-durable store for tests and throwaway instances.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counter: AtomicU64,
    records: RwLock<HashMap<u64, f64>>,
    dedup: RwLock<HashMap<InputPair, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first allocated id will be `floor + 1`.
    pub fn with_counter_floor(floor: u64) -> Self {
        Self {
            counter: AtomicU64::new(floor),
            ..Self::default()
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> StoreResult<usize> {
        Ok(self.records.read()?.len())
    }
}

impl RecordStore for MemoryStore {
    fn allocate_id(&self) -> StoreResult<u64> {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map(|previous| previous + 1)
            .map_err(|_| StoreError::InvariantViolation("id counter exhausted".into()))
    }

    fn put_record(&self, id: u64, value: f64) -> StoreResult<()> {
        let mut records = self.records.write()?;
        if records.contains_key(&id) {
            return Err(StoreError::InvariantViolation(format!(
                "record {} already exists",
                id
            )));
        }
        records.insert(id, value);
        Ok(())
    }

    fn get_record(&self, id: u64) -> StoreResult<Option<f64>> {
        Ok(self.records.read()?.get(&id).copied())
    }

    fn get_dedup_id(&self, pair: &InputPair) -> StoreResult<Option<u64>> {
        Ok(self.dedup.read()?.get(pair).copied())
    }

    fn put_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<DedupClaim> {
        let mut dedup = self.dedup.write()?;
        if dedup.contains_key(pair) {
            return Ok(DedupClaim::AlreadyClaimed);
        }
        dedup.insert(*pair, id);
        Ok(DedupClaim::Claimed)
    }

    fn release_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<()> {
        let mut dedup = self.dedup.write()?;
        if dedup.get(pair) == Some(&id) {
            dedup.remove(pair);
        }
        Ok(())
    }
}
