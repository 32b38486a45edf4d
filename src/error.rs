use std::{error::Error, fmt, io};

use crate::transport::PeerId;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Error returned when a scheduler can't be bound to a new optimizer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindError {
    /// Delayed averaging replaces the optimizer, but no scheduler factory was given.
    MissingFactory,
    /// The scheduler was built for an optimizer generation that no longer exists.
    StaleOptimizer { bound: u64, current: u64 },
}

impl fmt::Display for RebindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebindError::MissingFactory => f.write_str(
                "enabling `delay_optimizer_step`, `delay_state_averaging` or `delay_grad_averaging` \
                 requires a `scheduler_fn`, the optimizer is re-created on every delayed round",
            ),
            RebindError::StaleOptimizer { bound, current } => write!(
                f,
                "scheduler is bound to optimizer generation {bound}, current generation is {current}"
            ),
        }
    }
}

impl Error for RebindError {}

/// Every failure the coordinator can surface.
#[derive(Debug)]
pub enum CoordinatorError {
    /// A local step reported a non positive amount of samples.
    InvalidContribution { samples: u64 },
    /// No valid peer response arrived before the round timed out.
    RoundFailed {
        round: u64,
        epoch: u64,
        expected: Vec<PeerId>,
    },
    Rebind(RebindError),
    /// Invalid option combination, caught before training starts.
    ConfigurationConflict(String),
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// An invalidated `OptimizerHandle` was used.
    StaleHandle { generation: u64, current: u64 },
    /// Too many consecutive rounds failed and the policy says to abort.
    Aborted { round: u64, failures: u32 },
    /// The round was cancelled because the coordinator is shutting down.
    Cancelled,
    Io(io::Error),
    Join(String),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidContribution { samples } => {
                write!(f, "invalid contribution: {samples} samples, must be positive")
            }
            Self::RoundFailed {
                round,
                epoch,
                expected,
            } => {
                let names: Vec<_> = expected.iter().map(PeerId::as_str).collect();
                write!(
                    f,
                    "round {round} (epoch {epoch}) failed: no valid contribution from [{}]",
                    names.join(", ")
                )
            }
            Self::Rebind(e) => write!(f, "rebind error: {e}"),
            Self::ConfigurationConflict(msg) => write!(f, "configuration conflict: {msg}"),
            Self::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} length mismatch: got {got}, expected {expected}"),
            Self::StaleHandle {
                generation,
                current,
            } => write!(
                f,
                "optimizer handle of generation {generation} was invalidated, current is {current}"
            ),
            Self::Aborted { round, failures } => write!(
                f,
                "aborted after round {round}: {failures} consecutive failed round(s)"
            ),
            Self::Cancelled => f.write_str("round cancelled"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Join(msg) => write!(f, "background round panicked: {msg}"),
        }
    }
}

impl Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rebind(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl CoordinatorError {
    /// Returns true for failures local to a single round, these never abort the run on their own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RoundFailed { .. })
    }
}

impl From<io::Error> for CoordinatorError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<RebindError> for CoordinatorError {
    fn from(value: RebindError) -> Self {
        Self::Rebind(value)
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(value: serde_json::Error) -> Self {
        Self::ConfigurationConflict(value.to_string())
    }
}
