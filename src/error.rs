use thiserror::Error;

use crate::config::ConfigError;
use crate::maintenance::StepError;
use crate::maintenance::gateway::GatewayError;
use crate::maintenance::lock::LockError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error: a thin wrapper over the per-module
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Step(e) => e.transience(),
            Error::Lock(e) => e.transience(),
            Error::Gateway(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Step(e) => e.effect(),
            Error::Lock(e) => e.effect(),
            Error::Gateway(e) => e.effect(),
            Error::Config(_) => Effect::None,
            Error::Io(_) => Effect::Unknown,
        }
    }
}
