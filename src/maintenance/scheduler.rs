//! Step scheduling: cadence tracking plus in-process serialization of
//! lock-requiring steps.
//!
//! The scheduler guarantees that at most one lock-requiring step runs at a
//! time within this process; cross-process exclusion is the maintenance
//! lock's job. Failure of one step never unschedules another.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use crate::maintenance::{MaintenanceStep, StepOutcome};

/// Poll interval when nothing is registered.
const IDLE_POLL: Duration = Duration::from_secs(60);

struct Registration {
    step: Arc<dyn MaintenanceStep>,
    interval: Duration,
}

pub struct Scheduler {
    steps: HashMap<&'static str, Registration>,
    pending: HashMap<&'static str, Instant>,
    heap: BinaryHeap<Reverse<(Instant, &'static str)>>,
    exclusive: Mutex<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
            exclusive: Mutex::new(()),
        }
    }

    /// Register a step to run every `interval`, first firing one interval
    /// from now. Re-registering a name replaces its step and cadence.
    pub fn register(&mut self, step: Arc<dyn MaintenanceStep>, interval: Duration) {
        self.register_at(step, interval, Instant::now());
    }

    pub fn register_at(
        &mut self,
        step: Arc<dyn MaintenanceStep>,
        interval: Duration,
        now: Instant,
    ) {
        let name = step.name();
        self.steps.insert(name, Registration { step, interval });
        self.schedule(name, now + interval);
    }

    /// Earliest pending deadline, if any step is scheduled.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove and return every step due at `now`, rescheduling each at its
    /// next cadence tick. The reschedule happens on drain, not on
    /// completion, so a failing step keeps its cadence.
    pub fn drain_due(&mut self, now: Instant) -> Vec<Arc<dyn MaintenanceStep>> {
        let mut due = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, name))) = self.heap.peek().copied() else {
                break;
            };
            if fire_at > now {
                break;
            }
            let _ = self.heap.pop();
            if self.pending.get(name).copied() != Some(fire_at) {
                continue;
            }
            self.pending.remove(name);
            if let Some(reg) = self.steps.get(name) {
                due.push(reg.step.clone());
                self.schedule(name, now + reg.interval);
            }
        }
        due
    }

    /// Run a step immediately, honoring in-process serialization for
    /// lock-requiring steps.
    pub fn run_now(&self, step: &dyn MaintenanceStep) -> StepOutcome {
        if step.requires_exclusive_lock() {
            let _serial = self
                .exclusive
                .lock()
                .expect("maintenance serialization lock poisoned");
            step.run()
        } else {
            step.run()
        }
    }

    /// Drain steps due at `now` and run each, returning their outcomes.
    pub fn run_pending(&mut self, now: Instant) -> Vec<(&'static str, StepOutcome)> {
        self.drain_due(now)
            .into_iter()
            .map(|step| {
                let name = step.name();
                (name, self.run_now(step.as_ref()))
            })
            .collect()
    }

    fn schedule(&mut self, name: &'static str, deadline: Instant) {
        self.pending.insert(name, deadline);
        self.heap.push(Reverse((deadline, name)));
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, name))) = self.heap.peek() {
            match self.pending.get(name).copied() {
                Some(current) if current == *fire_at => break,
                _ => {
                    let _ = self.heap.pop();
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop: sleep until the next deadline, run due steps, repeat.
/// Exits when the shutdown channel receives or disconnects.
pub fn run_scheduler_loop(mut scheduler: Scheduler, shutdown: Receiver<()>) {
    loop {
        let timeout = scheduler
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_POLL);

        match shutdown.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                for (name, outcome) in scheduler.run_pending(Instant::now()) {
                    match outcome {
                        StepOutcome::Completed(_) => info!(step = name, "maintenance completed"),
                        StepOutcome::Skipped(reason) => {
                            info!(step = name, %reason, "maintenance skipped");
                        }
                        StepOutcome::Failed(err) => {
                            warn!(step = name, error = %err, "maintenance failed");
                        }
                    }
                }
            }
        }
    }
}
