//! Loose object cleanup: drop loose objects already present in packs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info_span;

use crate::maintenance::gateway::GitGateway;
use crate::maintenance::lock::{Liveness, ProcessLiveness};
use crate::maintenance::metrics::{self, MetricsRecord};
use crate::maintenance::{MaintenanceStep, StepError, StepOutcome};

/// Counts loose objects in the store's fan-out directories, prunes the
/// ones already packed, and counts again. Hydration fetches land as packs,
/// but local index writes and tooling still produce loose objects that
/// accumulate in the shared store.
pub struct LooseObjectsStep {
    objects_root: PathBuf,
    gateway: Arc<dyn GitGateway>,
    liveness: Arc<dyn Liveness>,
}

impl LooseObjectsStep {
    pub fn new(objects_root: PathBuf, gateway: Arc<dyn GitGateway>) -> Self {
        Self::with_liveness(objects_root, gateway, Arc::new(ProcessLiveness))
    }

    pub fn with_liveness(
        objects_root: PathBuf,
        gateway: Arc<dyn GitGateway>,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self {
            objects_root,
            gateway,
            liveness,
        }
    }

    fn perform(&self, record: &mut MetricsRecord) -> Result<(), StepError> {
        let before = count_loose_objects(&self.objects_root)?;
        record.set("LooseObjectsBefore", before);
        metrics::emit_phase(self.name(), "before", record);

        {
            let _span = info_span!("prune_packed").entered();
            self.gateway.prune_packed(&self.objects_root)?;
        }

        let after = count_loose_objects(&self.objects_root)?;
        record.set("LooseObjectsAfter", after);
        metrics::emit_phase(self.name(), "prune", record);

        Ok(())
    }
}

impl MaintenanceStep for LooseObjectsStep {
    fn name(&self) -> &'static str {
        "loose_objects"
    }

    fn run(&self) -> StepOutcome {
        super::run_exclusive(
            self.name(),
            &self.objects_root,
            self.liveness.as_ref(),
            |record| self.perform(record),
        )
    }
}

/// Count files under the two-hex-digit fan-out directories. Tolerates a
/// store that does not exist yet and entries vanishing mid-scan.
fn count_loose_objects(objects_root: &Path) -> io::Result<u64> {
    let entries = match fs::read_dir(objects_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut count = 0u64;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.len() != 2 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let children = match fs::read_dir(&path) {
            Ok(children) => children,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for child in children {
            let child = child?;
            if child.file_type().map(|t| t.is_file()).unwrap_or(false) {
                count = count.saturating_add(1);
            }
        }
    }
    Ok(count)
}
