//! Collaborative batch accumulation across unreliable peers.
//!
//! Every process records the samples of its local micro-batches, and once the samples
//! accumulated by the whole run reach the target batch size the peers average their
//! gradients (and periodically their parameters) and take one optimizer step together.
//! Rounds either block the training loop or run in the background while training
//! continues on the previous parameters.

pub mod accumulation;
pub mod averaging;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod optimization;
pub mod progress;
pub mod scheduling;
pub mod transport;

pub use config::{CoordinatorConfig, FailurePolicy};
pub use coordinator::{Coordinator, CoordinatorBuilder, StepOutcome};
pub use error::{CoordinatorError, RebindError, Result};
