pub mod model;
pub mod storage;
pub mod store;
pub mod calculator;
pub mod service;
pub mod parser;
pub mod render;
pub mod server;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::model::{InputPair, LogEntry};
use crate::storage::Segment;
use crate::store::{DedupClaim, RecordStore, StoreError, StoreResult};

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// fsync every append before acknowledging it.
    pub strict_durability: bool,
    /// Ids are allocated strictly above this value.
    pub counter_floor: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            strict_durability: true,
            counter_floor: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub records: u64,
    pub dedup_entries: u64,
    pub counter: u64,
    pub log_entries: u64,
    /// Log frames a compaction would drop.
    pub reclaimable: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub kept: u64,
    pub reclaimed: u64,
}

/// Durable record store over a single append-only segment.
///
/// Every mutation is appended to the log before it is published to the
/// in-memory maps, so anything a reader can see survives a restart. Locks
/// are taken index-first, segment-second.
pub struct BmiDb {
    active_segment: Mutex<Segment>,
    counter: Mutex<u64>,
    records: RwLock<HashMap<u64, f64>>,
    dedup: RwLock<HashMap<InputPair, u64>>,
    log_entries: AtomicU64,
}

impl fmt::Debug for BmiDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmiDb")
            .field("record_count", &self.records.read().map(|r| r.len()).unwrap_or(0))
            .field("log_entries", &self.log_entries.load(Ordering::Relaxed))
            .finish()
    }
}

impl BmiDb {
    pub fn open(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut segment = Segment::new(path, options.strict_durability)?;
        if segment.is_empty() {
            info!(path = %path.display(), "starting a new record log");
        }
        let entries = segment.replay().map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Io(e),
        })?;
        let log_entries = entries.len() as u64;

        let mut counter = options.counter_floor;
        let mut records = HashMap::new();
        let mut claims = Vec::new();

        for entry in entries {
            match entry {
                LogEntry::Counter { value } => counter = counter.max(value),
                LogEntry::Record { id, value } => {
                    if records.insert(id, value).is_some() {
                        return Err(StoreError::Corrupt(format!("record {} written twice", id)));
                    }
                    counter = counter.max(id);
                }
                LogEntry::Dedup { weight, height, id } => {
                    let pair = InputPair::new(weight, height).ok_or_else(|| {
                        StoreError::Corrupt(format!("dedup entry {}-{} has a zero component", weight, height))
                    })?;
                    claims.push((pair, id));
                }
            }
        }

        // A claim whose record never reached the log was cut off by a crash.
        // The first claim per pair that does have its record is the winner.
        let mut dedup = HashMap::new();
        for (pair, id) in claims {
            if !records.contains_key(&id) {
                warn!(pair = %pair, id, "dropping dedup entry without a record");
                continue;
            }
            dedup.entry(pair).or_insert(id);
        }

        info!(
            path = %path.display(),
            records = records.len(),
            dedup_entries = dedup.len(),
            counter,
            log_entries,
            "record log opened"
        );

        Ok(Self {
            active_segment: Mutex::new(segment),
            counter: Mutex::new(counter),
            records: RwLock::new(records),
            dedup: RwLock::new(dedup),
            log_entries: AtomicU64::new(log_entries),
        })
    }

    pub fn stats(&self) -> StoreResult<DbStats> {
        let records = self.records.read()?.len() as u64;
        let dedup_entries = self.dedup.read()?.len() as u64;
        let counter = *self.counter.lock()?;
        let log_entries = self.log_entries.load(Ordering::SeqCst);
        let live = records + dedup_entries + u64::from(counter > 0);

        Ok(DbStats {
            records,
            dedup_entries,
            counter,
            log_entries,
            reclaimable: log_entries.saturating_sub(live),
        })
    }

    /// Rewrites the log as one counter frame plus every live record and
    /// dedup entry, then swaps it in place of the old file.
    ///
    /// Writers are blocked for the duration; readers are not.
    pub fn compact(&self) -> StoreResult<CompactionReport> {
        let records = self.records.read()?;
        let dedup = self.dedup.read()?;
        let counter = self.counter.lock()?;
        let mut segment = self.active_segment.lock()?;

        let old_path = segment.file_path.clone();
        let new_path = old_path.with_extension("compacting");
        if new_path.exists() {
            fs::remove_file(&new_path)?;
        }

        let before = self.log_entries.load(Ordering::SeqCst);
        info!(log_entries = before, bytes = segment.len(), "compaction started");

        let mut fresh = Segment::new(&new_path, false)?;
        let mut kept = 0u64;

        if *counter > 0 {
            fresh.append(&LogEntry::Counter { value: *counter })?;
            kept += 1;
        }

        let mut ids: Vec<(&u64, &f64)> = records.iter().collect();
        ids.sort_unstable_by_key(|(id, _)| **id);
        for (&id, &value) in ids {
            fresh.append(&LogEntry::Record { id, value })?;
            kept += 1;
        }

        let mut claims: Vec<(&InputPair, &u64)> = dedup.iter().collect();
        claims.sort_unstable_by_key(|(_, id)| **id);
        for (pair, &id) in claims {
            fresh.append(&LogEntry::Dedup {
                weight: pair.weight(),
                height: pair.height(),
                id,
            })?;
            kept += 1;
        }

        fresh.sync()?;
        drop(fresh);

        fs::rename(&new_path, &old_path)?;
        let strict = segment.is_strict();
        *segment = Segment::new(&old_path, strict)?;
        self.log_entries.store(kept, Ordering::SeqCst);

        let reclaimed = before.saturating_sub(kept);
        info!(kept, reclaimed, bytes = segment.len(), "compaction complete");
        Ok(CompactionReport { kept, reclaimed })
    }

    fn append(&self, entry: &LogEntry) -> StoreResult<()> {
        let mut segment = self.active_segment.lock()?;
        segment.append(entry)?;
        self.log_entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl RecordStore for BmiDb {
    fn allocate_id(&self) -> StoreResult<u64> {
        let mut counter = self.counter.lock()?;
        let next = counter
            .checked_add(1)
            .ok_or_else(|| StoreError::InvariantViolation("id counter exhausted".into()))?;
        // Persisted before it is handed out, so a restart can never reissue it.
        self.append(&LogEntry::Counter { value: next })?;
        *counter = next;
        Ok(next)
    }

    fn put_record(&self, id: u64, value: f64) -> StoreResult<()> {
        let mut records = self.records.write()?;
        if records.contains_key(&id) {
            return Err(StoreError::InvariantViolation(format!(
                "record {} already exists",
                id
            )));
        }
        self.append(&LogEntry::Record { id, value })?;
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
        self.append(&LogEntry::Dedup {
            weight: pair.weight(),
            height: pair.height(),
            id,
        })?;
        dedup.insert(*pair, id);
        Ok(DedupClaim::Claimed)
    }

    /// Only the in-memory claim is dropped. Its frame stays in the log, but a
    /// released claim never has a record behind it, so replay discards it.
    fn release_dedup_id(&self, pair: &InputPair, id: u64) -> StoreResult<()> {
        let mut dedup = self.dedup.write()?;
        if dedup.get(pair) == Some(&id) {
            dedup.remove(pair);
            debug!(pair = %pair, id, "dedup claim released");
        }
        Ok(())
    }
}
