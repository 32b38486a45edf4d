mod rebinder;
mod scheduler;

pub use rebinder::{EpochSyncedScheduler, SchedulerFactory, SchedulerRebinder};
pub use scheduler::{ExponentialLr, LrScheduler, StepLr};
