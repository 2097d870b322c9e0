#![forbid(unsafe_code)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod paths;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the maintenance surface at crate root for convenience
pub use crate::maintenance::{
    MaintenanceStep, SkipReason, StepError, StepOutcome,
    gateway::{GatewayError, GitGateway, GitProcessGateway},
    inspector::PackDirectorySnapshot,
    lock::{Liveness, LockError, LockHolder, MaintenanceLock},
    metrics::MetricsRecord,
    pack_step::{BATCH_SIZE_MIB, PackCompactionStep},
    scheduler::Scheduler,
};
