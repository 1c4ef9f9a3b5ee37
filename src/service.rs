use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::calculator;
use crate::model::{InputPair, Record};
use crate::store::{DedupClaim, RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("record {0} not found")]
    NotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The dedup index and the records disagree.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The blocking task running a store call died before it returned.
    #[error("store task aborted: {0}")]
    Aborted(String),
}

impl ServiceError {
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            ServiceError::InvariantViolation(_) => true,
            ServiceError::Store(e) => e.is_invariant_violation(),
            _ => false,
        }
    }
}

/// Get-or-create and lookup on top of a record store.
///
/// Holds no state of its own; clones share the same store.
#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn RecordStore>,
}

impl fmt::Debug for RecordService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordService").finish_non_exhaustive()
    }
}

impl RecordService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Returns the id of the record for `pair`, creating it on first sight.
    ///
    /// The dedup write is the arbiter: of several concurrent creators only
    /// the one whose set-if-absent lands keeps its id, the rest throw theirs
    /// away and return the winner's. A winner that then fails to write its
    /// record takes the claim back, so the pair is never left pointing at
    /// nothing.
    pub fn get_or_create(&self, pair: InputPair) -> Result<u64, ServiceError> {
        if let Some(id) = self.store.get_dedup_id(&pair)? {
            debug!(pair = %pair, id, "dedup hit");
            return Ok(id);
        }

        let value = calculator::compute(pair);
        let id = self.store.allocate_id()?;

        match self.store.put_dedup_id(&pair, id)? {
            DedupClaim::Claimed => {
                if let Err(e) = self.store.put_record(id, value) {
                    if let Err(release) = self.store.release_dedup_id(&pair, id) {
                        error!(pair = %pair, id, error = %release, "could not release dedup claim");
                    }
                    return Err(e.into());
                }
                info!(pair = %pair, id, value, "record created");
                Ok(id)
            }
            DedupClaim::AlreadyClaimed => {
                let winner = self.store.get_dedup_id(&pair)?.ok_or_else(|| {
                    ServiceError::InvariantViolation(format!(
                        "dedup entry for {} claimed but unreadable",
                        pair
                    ))
                })?;
                info!(pair = %pair, discarded = id, winner, "lost creation race");
                Ok(winner)
            }
        }
    }

    pub fn lookup(&self, id: u64) -> Result<Record, ServiceError> {
        if id == 0 {
            return Err(ServiceError::NotFound(id));
        }
        match self.store.get_record(id)? {
            Some(value) => Ok(Record { id, value }),
            None => Err(ServiceError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult};
    use std::collections::HashSet;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn pair(weight: u32, height: u32) -> InputPair {
        InputPair::new(weight, height).unwrap()
    }

    fn service_with(store: Arc<MemoryStore>) -> RecordService {
        RecordService::new(store)
    }

    #[test]
    fn repeated_requests_return_the_same_id() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone());

        let first = service.get_or_create(pair(70, 170)).unwrap();
        for _ in 0..5 {
            assert_eq!(service.get_or_create(pair(70, 170)).unwrap(), first);
        }
        assert_eq!(store.counter(), 1);
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn distinct_pairs_get_distinct_increasing_ids() {
        let service = service_with(Arc::new(MemoryStore::new()));

        let ids: Vec<u64> = [(70, 170), (80, 180), (170, 70), (1, 1)]
            .iter()
            .map(|&(w, h)| service.get_or_create(pair(w, h)).unwrap())
            .collect();

        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn lookup_returns_computed_value() {
        let service = service_with(Arc::new(MemoryStore::new()));
        let p = pair(70, 170);

        let id = service.get_or_create(p).unwrap();
        let record = service.lookup(id).unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.value, calculator::compute(p));
    }

    #[test]
    fn unknown_and_zero_ids_are_not_found() {
        let service = service_with(Arc::new(MemoryStore::new()));
        service.get_or_create(pair(70, 170)).unwrap();

        assert!(matches!(service.lookup(999), Err(ServiceError::NotFound(999))));
        assert!(matches!(service.lookup(0), Err(ServiceError::NotFound(0))));
    }

    #[test]
    fn concurrent_creators_agree_on_one_record() {
        const CALLERS: usize = 16;
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone());
        let barrier = Barrier::new(CALLERS);

        let ids: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        service.get_or_create(pair(70, 170)).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), CALLERS);
        assert_eq!(unique.len(), 1);
        assert_eq!(store.record_count().unwrap(), 1);

        let id = ids[0];
        assert_eq!(service.lookup(id).unwrap().value, 70.0 / 28900.0);
    }

    /// Reports the dedup index as empty for the first `stale_reads` lookups,
    /// as a caller that checked just before a competing writer landed would.
    struct StaleReadStore {
        inner: MemoryStore,
        stale_reads: AtomicUsize,
    }

    impl RecordStore for StaleReadStore {
        fn allocate_id(&self) -> StoreResult<u64> {
            self.inner.allocate_id()
        }

        fn put_record(&self, id: u64, value: f64) -> StoreResult<()> {
            self.inner.put_record(id, value)
        }

        fn get_record(&self, id: u64) -> StoreResult<Option<f64>> {
            self.inner.get_record(id)
        }

        fn get_dedup_id(&self, pair: &InputPair) -> StoreResult<Option<u64>> {
            let stale = self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                return Ok(None);
            }
            self.inner.get_dedup_id(pair)
        }

        fn put_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<DedupClaim> {
            self.inner.put_dedup_id(pair, id)
        }

        fn release_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<()> {
            self.inner.release_dedup_id(pair, id)
        }
    }

    #[test]
    fn race_loser_discards_its_id_and_returns_the_winner() {
        let inner = MemoryStore::new();
        let p = pair(70, 170);
        inner.put_dedup_id(&p, inner.allocate_id().unwrap()).unwrap();
        inner.put_record(1, calculator::compute(p)).unwrap();

        let store = Arc::new(StaleReadStore {
            inner,
            stale_reads: AtomicUsize::new(1),
        });
        let service = RecordService::new(store.clone());

        assert_eq!(service.get_or_create(p).unwrap(), 1);
        // The loser's allocation leaves a gap but no second record.
        assert_eq!(store.inner.counter(), 2);
        assert_eq!(store.inner.record_count().unwrap(), 1);
        assert_eq!(store.inner.get_record(2).unwrap(), None);
    }

    struct UnavailableStore;

    fn unavailable<T>() -> StoreResult<T> {
        Err(StoreError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "backend down")))
    }

    impl RecordStore for UnavailableStore {
        fn allocate_id(&self) -> StoreResult<u64> {
            unavailable()
        }
        fn put_record(&self, _: u64, _: f64) -> StoreResult<()> {
            unavailable()
        }
        fn get_record(&self, _: u64) -> StoreResult<Option<f64>> {
            unavailable()
        }
        fn get_dedup_id(&self, _: &InputPair) -> StoreResult<Option<u64>> {
            unavailable()
        }
        fn put_dedup_id(&self, _: &InputPair, _: u64) -> StoreResult<DedupClaim> {
            unavailable()
        }
        fn release_dedup_id(&self, _: &InputPair, _: u64) -> StoreResult<()> {
            unavailable()
        }
    }

    #[test]
    fn store_outage_propagates_instead_of_fabricating() {
        let service = RecordService::new(Arc::new(UnavailableStore));

        let err = service.get_or_create(pair(70, 170)).unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::Io(_))));
        assert!(!err.is_invariant_violation());

        assert!(matches!(service.lookup(1), Err(ServiceError::Store(_))));
    }

    #[test]
    fn overwrite_attempt_surfaces_as_invariant_violation() {
        let store = Arc::new(MemoryStore::new());
        // Id 1 is already taken by a record nobody indexed.
        store.put_record(1, 1.0).unwrap();
        let service = service_with(store);

        let err = service.get_or_create(pair(70, 170)).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    /// Fails the first `failures` record writes, like a disk that fills up
    /// and is then cleared.
    struct FailingRecordWrites {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl RecordStore for FailingRecordWrites {
        fn allocate_id(&self) -> StoreResult<u64> {
            self.inner.allocate_id()
        }

        fn put_record(&self, id: u64, value: f64) -> StoreResult<()> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return unavailable();
            }
            self.inner.put_record(id, value)
        }

        fn get_record(&self, id: u64) -> StoreResult<Option<f64>> {
            self.inner.get_record(id)
        }

        fn get_dedup_id(&self, pair: &InputPair) -> StoreResult<Option<u64>> {
            self.inner.get_dedup_id(pair)
        }

        fn put_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<DedupClaim> {
            self.inner.put_dedup_id(pair, id)
        }

        fn release_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<()> {
            self.inner.release_dedup_id(pair, id)
        }
    }

    #[test]
    fn failed_record_write_leaves_no_dangling_claim() {
        let store = Arc::new(FailingRecordWrites {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(1),
        });
        let service = RecordService::new(store.clone());
        let p = pair(70, 170);

        let err = service.get_or_create(p).unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::Io(_))));
        assert_eq!(store.inner.get_dedup_id(&p).unwrap(), None);

        let id = service.get_or_create(p).unwrap();
        assert_eq!(id, 2);
        assert_eq!(service.lookup(id).unwrap().value, calculator::compute(p));
        assert_eq!(store.inner.record_count().unwrap(), 1);
    }

    #[test]
    fn missing_winner_is_an_invariant_violation() {
        // Claims and forgets, as a store whose index lost an entry would.
        struct ForgetfulStore(MemoryStore);

        impl RecordStore for ForgetfulStore {
            fn allocate_id(&self) -> StoreResult<u64> {
                self.0.allocate_id()
            }
            fn put_record(&self, id: u64, value: f64) -> StoreResult<()> {
                self.0.put_record(id, value)
            }
            fn get_record(&self, id: u64) -> StoreResult<Option<f64>> {
                self.0.get_record(id)
            }
            fn get_dedup_id(&self, _: &InputPair) -> StoreResult<Option<u64>> {
                Ok(None)
            }
            fn put_dedup_id(&self, _: &InputPair, _: u64) -> StoreResult<DedupClaim> {
                Ok(DedupClaim::AlreadyClaimed)
            }
            fn release_dedup_id(&self, _: &InputPair, _: u64) -> StoreResult<()> {
                Ok(())
            }
        }

        let service = RecordService::new(Arc::new(ForgetfulStore(MemoryStore::new())));
        let err = service.get_or_create(pair(70, 170)).unwrap_err();
        assert!(matches!(err, ServiceError::InvariantViolation(_)));
        assert!(err.is_invariant_violation());
    }
}
