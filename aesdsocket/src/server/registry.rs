//! Worker registry - bookkeeping for in-flight connection tasks
//!
//! Records are keyed by a monotonic connection id. The map lock is only held
//! to insert or remove records, never across a join.

use crate::shutdown::DrainReport;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Completion flag shared between a connection task and its record.
///
/// Transitions false -> true exactly once, set by the task itself.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns a guard that marks the flag complete when dropped, so the flag
    /// is set as the task's final action on every exit path.
    #[must_use]
    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard(self.clone())
    }

    fn mark_complete(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct CompletionGuard(CompletionFlag);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.mark_complete();
    }
}

/// Bookkeeping entry for one connection task
#[derive(Debug)]
pub struct WorkerRecord {
    id: u64,
    peer: SocketAddr,
    handle: JoinHandle<()>,
    complete: CompletionFlag,
}

impl WorkerRecord {
    pub fn new(id: u64, peer: SocketAddr, handle: JoinHandle<()>, complete: CompletionFlag) -> Self {
        Self {
            id,
            peer,
            handle,
            complete,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete.is_complete()
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, WorkerRecord>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the id for the next connection
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, record: WorkerRecord) {
        let id = record.id;
        if self.lock().insert(id, record).is_some() {
            warn!(target: "aesdsocket::registry", conn_id = id, "Replaced duplicate worker record");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of records whose task has not yet marked itself complete.
    ///
    /// Finished records waiting to be reaped are not counted.
    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|record| !record.is_complete()).count()
    }

    /// Join and remove every record whose task has marked itself complete.
    ///
    /// Returns the number of records reaped.
    pub async fn reap(&self) -> usize {
        let finished: Vec<WorkerRecord> = {
            let mut workers = self.lock();
            let ids: Vec<u64> = workers
                .values()
                .filter(|record| record.is_complete())
                .map(WorkerRecord::id)
                .collect();
            ids.iter().filter_map(|id| workers.remove(id)).collect()
        };

        let count = finished.len();
        for record in finished {
            join_record(record).await;
        }
        if count > 0 {
            debug!(target: "aesdsocket::registry", reaped = count, "Reaped finished connections");
        }
        count
    }

    /// Join every remaining task regardless of its completion flag.
    ///
    /// Tasks still running when `grace` elapses are aborted, which drops the
    /// socket they own. The registry is empty when this returns.
    pub async fn drain_all(&self, grace: Duration) -> DrainReport {
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = DrainReport::default();

        loop {
            let remaining: Vec<WorkerRecord> = self.lock().drain().map(|(_, r)| r).collect();
            if remaining.is_empty() {
                break;
            }

            for mut record in remaining {
                match tokio::time::timeout_at(deadline, &mut record.handle).await {
                    Ok(result) => {
                        log_join_result(record.id, record.peer, result);
                        report.joined += 1;
                    },
                    Err(_) => {
                        warn!(
                            target: "aesdsocket::registry",
                            conn_id = record.id,
                            peer = %record.peer,
                            "Connection still active after grace period, aborting"
                        );
                        record.handle.abort();
                        let _ = (&mut record.handle).await;
                        report.aborted += 1;
                    },
                }
            }
        }

        report
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, WorkerRecord>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn join_record(record: WorkerRecord) {
    let WorkerRecord { id, peer, handle, .. } = record;
    log_join_result(id, peer, handle.await);
}

fn log_join_result(id: u64, peer: SocketAddr, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        warn!(
            target: "aesdsocket::registry",
            conn_id = id,
            peer = %peer,
            error = %e,
            "Connection task ended abnormally"
        );
    }
}
