//! Maintenance metrics: the per-run record plus a swappable emission sink.
//!
//! Emission goes through tracing by default. A test sink can be installed
//! to capture events in unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Write-once mapping of metric field names to integer values, built up
/// phase by phase and attached to the step's terminal event. Persistence
/// and transport belong to the external telemetry collaborator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsRecord {
    fields: BTreeMap<&'static str, u64>,
}

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: u64) {
        self.fields.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.fields.iter().map(|(name, value)| (*name, *value))
    }
}

/// Destination for maintenance events.
pub trait MetricSink: Send + Sync {
    /// One informational event per step phase.
    fn phase(&self, step: &'static str, phase: &'static str, record: &MetricsRecord);

    /// The terminal event for a run: `status` is one of `completed`,
    /// `skipped`, `failed`.
    fn terminal(
        &self,
        step: &'static str,
        status: &'static str,
        record: &MetricsRecord,
        elapsed: Duration,
    );
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn phase(&self, step: &'static str, phase: &'static str, record: &MetricsRecord) {
        tracing::info!(
            target: "metrics",
            step,
            phase,
            fields = ?record.fields,
            "maintenance phase"
        );
    }

    fn terminal(
        &self,
        step: &'static str,
        status: &'static str,
        record: &MetricsRecord,
        elapsed: Duration,
    ) {
        tracing::info!(
            target: "metrics",
            step,
            status,
            elapsed_ms = duration_ms(elapsed),
            fields = ?record.fields,
            "maintenance step finished"
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

pub fn emit_phase(step: &'static str, phase: &'static str, record: &MetricsRecord) {
    sink().phase(step, phase, record);
}

pub fn emit_terminal(
    step: &'static str,
    status: &'static str,
    record: &MetricsRecord,
    elapsed: Duration,
) {
    sink().terminal(step, status, record, elapsed);
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        phases: Mutex<Vec<(&'static str, &'static str)>>,
        terminals: Mutex<Vec<(&'static str, &'static str)>>,
    }

    impl MetricSink for TestSink {
        fn phase(&self, step: &'static str, phase: &'static str, _record: &MetricsRecord) {
            self.phases.lock().expect("phases lock").push((step, phase));
        }

        fn terminal(
            &self,
            step: &'static str,
            status: &'static str,
            _record: &MetricsRecord,
            _elapsed: Duration,
        ) {
            self.terminals
                .lock()
                .expect("terminals lock")
                .push((step, status));
        }
    }

    #[test]
    fn record_is_ordered_and_queryable() {
        let mut record = MetricsRecord::new();
        record.set("NumPacksBefore", 5);
        record.set("TotalSizeBefore", 1000);

        assert_eq!(record.get("NumPacksBefore"), Some(5));
        assert_eq!(record.get("Missing"), None);
        // BTreeMap ordering: fields come out sorted by name.
        let names: Vec<&str> = record.fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["NumPacksBefore", "TotalSizeBefore"]);
    }

    #[test]
    fn installed_sink_captures_emissions() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        let record = MetricsRecord::new();
        emit_phase("pack_compaction", "expire", &record);
        emit_terminal("pack_compaction", "completed", &record, Duration::from_millis(3));

        assert_eq!(
            sink.phases.lock().expect("phases lock").as_slice(),
            &[("pack_compaction", "expire")]
        );
        assert_eq!(
            sink.terminals.lock().expect("terminals lock").as_slice(),
            &[("pack_compaction", "completed")]
        );
    }
}
