use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::BmiDb;

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub strict_durability: bool, // true = fsync every append, false = OS buffer
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        // Single core: one worker for requests, one for blocking store I/O,
        // and skip fsync so a slow disk cannot stall the only CPU.
        if cores <= 1 {
            warn!(cores, "constrained host: running without fsync");
            return Self {
                logical_cores: cores,
                worker_threads: 2,
                strict_durability: false,
            };
        }

        Self {
            logical_cores: cores,
            worker_threads: cores,
            strict_durability: true,
        }
    }
}

/// Starts the background compaction thread.
/// Every `interval` it rewrites the log if any frames are reclaimable.
pub fn start_gc_thread(db: Arc<BmiDb>, interval: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!(interval_secs = interval.as_secs(), "background compaction started");
        loop {
            thread::sleep(interval);

            match db.stats() {
                Ok(stats) if stats.reclaimable == 0 => {
                    debug!("nothing to compact");
                }
                Ok(_) => {
                    if let Err(e) = db.compact() {
                        error!(error = %e, "compaction failed");
                    }
                }
                Err(e) => error!(error = %e, "could not read store stats"),
            }
        }
    })
}
