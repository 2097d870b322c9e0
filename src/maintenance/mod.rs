//! Maintenance engine for the shared object store.
//!
//! Provides:
//! - `MaintenanceStep` - the unit-of-work contract every step implements
//! - `MaintenanceLock` - crash-safe cross-process mutual exclusion
//! - `PackCompactionStep` / `LooseObjectsStep` - the concrete steps
//! - `Scheduler` - cadence tracking and in-process serialization

pub mod gateway;
pub mod inspector;
pub mod lock;
pub mod loose_step;
pub mod metrics;
pub mod pack_step;
pub mod scheduler;

use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::maintenance::gateway::GatewayError;
use crate::maintenance::lock::{Liveness, LockError, MaintenanceLock};
use crate::maintenance::metrics::MetricsRecord;

/// One compaction/consolidation operation over the object store.
///
/// Steps are stateless between invocations: each run must tolerate being
/// the very first run ever, or a retry after a prior crash.
pub trait MaintenanceStep: Send + Sync {
    /// Identifier used in logs and metric events.
    fn name(&self) -> &'static str;

    /// Whether this step mutates the store and therefore needs the
    /// maintenance lock. Non-exclusive steps may run concurrently with
    /// anything.
    fn requires_exclusive_lock(&self) -> bool {
        true
    }

    /// Perform the step. Must leave the store consistent and readable on
    /// every path, including failure.
    fn run(&self) -> StepOutcome;
}

/// Outcome of one maintenance run.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step ran to completion; the record holds its per-phase metrics.
    Completed(MetricsRecord),
    /// The step did not run and did not touch the store.
    Skipped(SkipReason),
    /// The step failed partway; future scheduled runs are unaffected.
    Failed(StepError),
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed(_))
    }

    /// The metrics record, when the step completed.
    pub fn record(&self) -> Option<&MetricsRecord> {
        match self {
            StepOutcome::Completed(record) => Some(record),
            _ => None,
        }
    }
}

/// Why a step declined to run. Not an error: a scheduling signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another maintenance holder is active, possibly in another process.
    LockBusy { holder_pid: Option<u32> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::LockBusy { holder_pid: Some(pid) } => {
                write!(f, "maintenance lock busy (held by pid {pid})")
            }
            SkipReason::LockBusy { holder_pid: None } => write!(f, "maintenance lock busy"),
        }
    }
}

/// Failure of a single run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Template for lock-requiring steps: acquire the maintenance lock (or
/// skip), run `perform`, release the lock on every path, emit the terminal
/// metric event.
pub(crate) fn run_exclusive(
    name: &'static str,
    objects_root: &Path,
    liveness: &dyn Liveness,
    perform: impl FnOnce(&mut MetricsRecord) -> Result<(), StepError>,
) -> StepOutcome {
    let started = Instant::now();

    let lock = match MaintenanceLock::try_acquire(objects_root, liveness) {
        Ok(lock) => lock,
        Err(LockError::Held { holder, .. }) => {
            let reason = SkipReason::LockBusy {
                holder_pid: holder.map(|h| h.pid),
            };
            info!(step = name, %reason, "maintenance skipped");
            metrics::emit_terminal(name, "skipped", &MetricsRecord::new(), started.elapsed());
            return StepOutcome::Skipped(reason);
        }
        Err(err) => {
            metrics::emit_terminal(name, "failed", &MetricsRecord::new(), started.elapsed());
            return StepOutcome::Failed(err.into());
        }
    };

    let mut record = MetricsRecord::new();
    let result = perform(&mut record);

    // Explicit release so removal errors are visible; Drop covers panics.
    if let Err(err) = lock.release() {
        warn!(step = name, error = %err, "maintenance lock release failed");
    }

    match result {
        Ok(()) => {
            metrics::emit_terminal(name, "completed", &record, started.elapsed());
            StepOutcome::Completed(record)
        }
        Err(err) => {
            warn!(step = name, error = %err, "maintenance step failed");
            metrics::emit_terminal(name, "failed", &record, started.elapsed());
            StepOutcome::Failed(err)
        }
    }
}

impl StepError {
    pub fn transience(&self) -> crate::Transience {
        match self {
            StepError::Lock(e) => e.transience(),
            StepError::Gateway(e) => e.transience(),
            StepError::Io(_) => crate::Transience::Unknown,
        }
    }

    pub fn effect(&self) -> crate::Effect {
        match self {
            StepError::Lock(e) => e.effect(),
            StepError::Gateway(e) => e.effect(),
            StepError::Io(_) => crate::Effect::Unknown,
        }
    }
}
