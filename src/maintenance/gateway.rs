//! External git invocation boundary.
//!
//! The compaction primitives (expire stale multi-pack-index entries,
//! repack through the multi-pack-index, prune packed loose objects) are
//! delegated to the external `git` executable. This module is the only
//! place that spawns it; everything else goes through the `GitGateway`
//! trait so tests can substitute a recording implementation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{Effect, Transience};

const MIB: u64 = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Compaction primitives the maintenance steps need from git.
pub trait GitGateway: Send + Sync {
    /// Drop multi-pack-index entries (and the packs they cover) that are
    /// fully superseded by other packs in the index.
    fn expire_multi_pack_index(&self, objects_root: &Path) -> Result<(), GatewayError>;

    /// Merge small packs referenced by the multi-pack-index into
    /// consolidated packs, each bounded by `batch_size_mib`. The tool
    /// unlinks input packs only after the outputs are written and indexed;
    /// that atomicity is what keeps concurrent readers safe.
    fn repack_multi_pack_index(
        &self,
        objects_root: &Path,
        batch_size_mib: u32,
    ) -> Result<(), GatewayError>;

    /// Remove loose objects that already exist in packs.
    fn prune_packed(&self, objects_root: &Path) -> Result<(), GatewayError>;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("git {command} exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("git {command} did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("failed to spawn git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn transience(&self) -> Transience {
        match self {
            GatewayError::CommandFailed { .. } => Transience::Unknown,
            GatewayError::TimedOut { .. } => Transience::Retryable,
            GatewayError::Spawn { .. } => Transience::Permanent,
            GatewayError::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The tool may have mutated the store before failing; its own
            // atomicity guarantees keep the store readable either way.
            GatewayError::CommandFailed { .. } | GatewayError::TimedOut { .. } => Effect::Unknown,
            GatewayError::Spawn { .. } => Effect::None,
            GatewayError::Io(_) => Effect::Unknown,
        }
    }
}

/// Gateway that spawns the real `git` binary.
pub struct GitProcessGateway {
    git_binary: PathBuf,
    timeout: Duration,
}

impl GitProcessGateway {
    pub fn new(timeout: Duration) -> Self {
        Self::with_binary(PathBuf::from("git"), timeout)
    }

    pub fn with_binary(git_binary: PathBuf, timeout: Duration) -> Self {
        Self {
            git_binary,
            timeout,
        }
    }

    /// Spawn git with stderr piped, wait against the deadline, kill on
    /// timeout. Stderr is drained on a separate thread so a chatty child
    /// cannot stall on a full pipe while we poll.
    fn run(&self, mut cmd: Command, command: String) -> Result<(), GatewayError> {
        tracing::debug!(command = %command, "invoking git");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| GatewayError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stderr_pipe = child.stderr.take();
        let drain = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GatewayError::TimedOut {
                        command,
                        timeout: self.timeout,
                    });
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        let stderr = drain.join().unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(GatewayError::CommandFailed {
                command,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

impl GitGateway for GitProcessGateway {
    fn expire_multi_pack_index(&self, objects_root: &Path) -> Result<(), GatewayError> {
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg("multi-pack-index")
            .arg(format!("--object-dir={}", objects_root.display()))
            .arg("expire");
        self.run(cmd, "multi-pack-index expire".to_string())
    }

    fn repack_multi_pack_index(
        &self,
        objects_root: &Path,
        batch_size_mib: u32,
    ) -> Result<(), GatewayError> {
        let batch_size_bytes = u64::from(batch_size_mib) * MIB;
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg("multi-pack-index")
            .arg(format!("--object-dir={}", objects_root.display()))
            .arg("repack")
            .arg(format!("--batch-size={batch_size_bytes}"));
        self.run(cmd, "multi-pack-index repack".to_string())
    }

    fn prune_packed(&self, objects_root: &Path) -> Result<(), GatewayError> {
        let mut cmd = Command::new(&self.git_binary);
        cmd.env("GIT_OBJECT_DIRECTORY", objects_root)
            .arg("prune-packed")
            .arg("--quiet");
        self.run(cmd, "prune-packed".to_string())
    }
}

/// One recorded gateway invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCall {
    Expire,
    Repack { batch_size_mib: u32 },
    PrunePacked,
}

type Script = Box<dyn Fn(&Path) -> Result<(), GatewayError> + Send + Sync>;

/// Scripted gateway for tests: records every invocation and runs injected
/// closures against the fixture store instead of spawning git.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    on_expire: Option<Script>,
    on_repack: Option<Script>,
    on_prune: Option<Script>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_expire(
        mut self,
        script: impl Fn(&Path) -> Result<(), GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.on_expire = Some(Box::new(script));
        self
    }

    pub fn on_repack(
        mut self,
        script: impl Fn(&Path) -> Result<(), GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.on_repack = Some(Box::new(script));
        self
    }

    pub fn on_prune(
        mut self,
        script: impl Fn(&Path) -> Result<(), GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.on_prune = Some(Box::new(script));
        self
    }

    /// Script a phase to fail with a command error.
    pub fn failing(command: &str, stderr: &str) -> impl Fn(&Path) -> Result<(), GatewayError> {
        let command = command.to_string();
        let stderr = stderr.to_string();
        move |_| {
            Err(GatewayError::CommandFailed {
                command: command.clone(),
                status: 128,
                stderr: stderr.clone(),
            })
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().expect("gateway calls lock poisoned").clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls
            .lock()
            .expect("gateway calls lock poisoned")
            .push(call);
    }
}

impl GitGateway for RecordingGateway {
    fn expire_multi_pack_index(&self, objects_root: &Path) -> Result<(), GatewayError> {
        self.record(GatewayCall::Expire);
        match &self.on_expire {
            Some(script) => script(objects_root),
            None => Ok(()),
        }
    }

    fn repack_multi_pack_index(
        &self,
        objects_root: &Path,
        batch_size_mib: u32,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::Repack { batch_size_mib });
        match &self.on_repack {
            Some(script) => script(objects_root),
            None => Ok(()),
        }
    }

    fn prune_packed(&self, objects_root: &Path) -> Result<(), GatewayError> {
        self.record(GatewayCall::PrunePacked);
        match &self.on_prune {
            Some(script) => script(objects_root),
            None => Ok(()),
        }
    }
}
