//! Pack compaction: expire superseded packs, then repack the remainder
//! through the multi-pack-index.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, info_span};

use crate::maintenance::gateway::GitGateway;
use crate::maintenance::inspector;
use crate::maintenance::lock::{Liveness, ProcessLiveness};
use crate::maintenance::metrics::{self, MetricsRecord};
use crate::maintenance::{MaintenanceStep, StepError, StepOutcome};
use crate::paths;

/// Batch ceiling passed to repack, in MiB. The pack format rejects 4 GiB
/// packs; 3 GiB leaves headroom.
pub const BATCH_SIZE_MIB: u32 = 3 * 1024;

/// Keeps the pack directory small: expires multi-pack-index entries for
/// superseded packs, then merges the remainder into consolidated packs
/// bounded by [`BATCH_SIZE_MIB`].
///
/// Repack relies on the external tool unlinking input packs only after the
/// consolidated outputs are written and indexed, so a failed repack leaves
/// either the pre-repack or the fully-repacked pack set, never a mixture.
pub struct PackCompactionStep {
    objects_root: PathBuf,
    gateway: Arc<dyn GitGateway>,
    liveness: Arc<dyn Liveness>,
}

impl PackCompactionStep {
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
        let pack_root = paths::pack_dir(&self.objects_root);

        let before = inspector::snapshot(&pack_root)?;
        record.set("TotalSizeBefore", before.total_size_bytes);
        record.set("NumPacksBefore", u64::from(before.pack_count));
        metrics::emit_phase(self.name(), "before", record);

        {
            let _span = info_span!("expire_multi_pack_index").entered();

            // A crashed `git multi-pack-index` run can leave its own lock
            // marker behind; clear it so expire is not wedged.
            let midx_lock = paths::multi_pack_index_lock_path(&pack_root);
            match fs::remove_file(&midx_lock) {
                Ok(()) => info!(path = %midx_lock.display(), "removed leftover multi-pack-index lock"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }

            // An expire failure aborts the run: repacking over an
            // inconsistent index could duplicate or lose objects.
            self.gateway.expire_multi_pack_index(&self.objects_root)?;
        }

        let after_expire = inspector::snapshot(&pack_root)?;
        record.set("TotalSizeAfterExpire", after_expire.total_size_bytes);
        record.set("NumPacksAfterExpire", u64::from(after_expire.pack_count));
        metrics::emit_phase(self.name(), "expire", record);

        {
            let _span = info_span!("repack_multi_pack_index").entered();
            self.gateway
                .repack_multi_pack_index(&self.objects_root, BATCH_SIZE_MIB)?;
        }

        let after_repack = inspector::snapshot(&pack_root)?;
        record.set("TotalSizeAfterRepack", after_repack.total_size_bytes);
        record.set("NumPacksAfterRepack", u64::from(after_repack.pack_count));
        metrics::emit_phase(self.name(), "repack", record);

        Ok(())
    }
}

impl MaintenanceStep for PackCompactionStep {
    fn name(&self) -> &'static str {
        "pack_compaction"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::SkipReason;
    use crate::maintenance::gateway::{GatewayCall, RecordingGateway};
    use crate::maintenance::lock::{LockHolder, MaintenanceLock};

    struct AssumeAlive;
    impl Liveness for AssumeAlive {
        fn is_alive(&self, _holder: &LockHolder) -> bool {
            true
        }
    }

    fn store_with_packs(packs: &[(&str, u64)]) -> tempfile::TempDir {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let pack_root = paths::pack_dir(temp.path());
        fs::create_dir_all(&pack_root).expect("mkdir");
        for (name, len) in packs {
            let file = fs::File::create(pack_root.join(name)).expect("create");
            file.set_len(*len).expect("set_len");
        }
        temp
    }

    #[test]
    fn empty_store_completes_with_zero_counts() {
        let store = store_with_packs(&[]);
        let gateway = Arc::new(RecordingGateway::new());
        let step = PackCompactionStep::new(store.path().to_path_buf(), gateway.clone());

        let outcome = step.run();
        let record = outcome.record().expect("completed");
        assert_eq!(record.get("NumPacksBefore"), Some(0));
        assert_eq!(record.get("TotalSizeBefore"), Some(0));
        assert_eq!(record.get("NumPacksAfterRepack"), Some(0));
        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::Expire,
                GatewayCall::Repack {
                    batch_size_mib: BATCH_SIZE_MIB
                }
            ]
        );
    }

    #[test]
    fn expire_failure_aborts_before_repack() {
        let store = store_with_packs(&[("pack-a.pack", 10)]);
        let gateway = Arc::new(
            RecordingGateway::new()
                .on_expire(RecordingGateway::failing("multi-pack-index expire", "boom")),
        );
        let step = PackCompactionStep::new(store.path().to_path_buf(), gateway.clone());

        let outcome = step.run();
        assert!(matches!(outcome, StepOutcome::Failed(StepError::Gateway(_))));
        // Repack must never have been invoked.
        assert_eq!(gateway.calls(), vec![GatewayCall::Expire]);
    }

    #[test]
    fn held_lock_skips_without_gateway_calls() {
        let store = store_with_packs(&[("pack-a.pack", 10)]);
        let gateway = Arc::new(RecordingGateway::new());
        let step = PackCompactionStep::with_liveness(
            store.path().to_path_buf(),
            gateway.clone(),
            Arc::new(AssumeAlive),
        );

        let _lock =
            MaintenanceLock::try_acquire(store.path(), &AssumeAlive).expect("acquire lock");
        let outcome = step.run();

        match outcome {
            StepOutcome::Skipped(SkipReason::LockBusy { holder_pid }) => {
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn leftover_multi_pack_index_lock_is_cleared() {
        let store = store_with_packs(&[("pack-a.pack", 10)]);
        let midx_lock = paths::multi_pack_index_lock_path(&paths::pack_dir(store.path()));
        fs::write(&midx_lock, b"").expect("write");

        let gateway = Arc::new(RecordingGateway::new());
        let step = PackCompactionStep::new(store.path().to_path_buf(), gateway);

        assert!(step.run().is_completed());
        assert!(!midx_lock.exists());
    }

    #[test]
    fn lock_is_released_after_failure() {
        let store = store_with_packs(&[]);
        let gateway = Arc::new(
            RecordingGateway::new()
                .on_expire(RecordingGateway::failing("multi-pack-index expire", "boom")),
        );
        let step = PackCompactionStep::new(store.path().to_path_buf(), gateway);

        assert!(matches!(step.run(), StepOutcome::Failed(_)));
        assert!(!paths::maintenance_lock_path(store.path()).exists());
    }
}
