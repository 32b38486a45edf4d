use std::{fmt, sync::Arc};

use log::debug;

use super::LrScheduler;
use crate::{error::RebindError, optimization::OptimizerHandle};

/// Builds a scheduler for a freshly created optimizer instance.
pub type SchedulerFactory = Arc<dyn Fn(&OptimizerHandle) -> Box<dyn LrScheduler> + Send + Sync>;

/// Wraps a scheduler so it only advances when the collective epoch advances.
///
/// Local steps that merely accumulate never move the schedule. When several epochs pass
/// at once (catching up from a peer) the schedule jumps straight to the latest one, the
/// learning rate is a function of the epoch alone.
pub struct EpochSyncedScheduler {
    generation: u64,
    current_epoch: u64,
    scheduler: Box<dyn LrScheduler>,
}

impl fmt::Debug for EpochSyncedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochSyncedScheduler")
            .field("generation", &self.generation)
            .field("current_epoch", &self.current_epoch)
            .finish_non_exhaustive()
    }
}

impl EpochSyncedScheduler {
    /// Binds `scheduler` to `optimizer` and applies the learning rate of its current epoch.
    pub fn bind(scheduler: Box<dyn LrScheduler>, optimizer: &mut OptimizerHandle) -> Self {
        let current_epoch = optimizer.epoch();
        optimizer.set_learning_rate(scheduler.lr_at(current_epoch));

        Self {
            generation: optimizer.generation(),
            current_epoch,
            scheduler,
        }
    }

    /// The optimizer generation this scheduler drives.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Advances the schedule up to the optimizer's epoch.
    ///
    /// # Returns
    /// The amount of epochs the schedule advanced, or `StaleOptimizer` if `optimizer`
    /// isn't the instance this scheduler was bound to.
    pub fn step(&mut self, optimizer: &mut OptimizerHandle) -> Result<u64, RebindError> {
        if optimizer.generation() != self.generation {
            return Err(RebindError::StaleOptimizer {
                bound: self.generation,
                current: optimizer.generation(),
            });
        }

        let advanced = optimizer.epoch().saturating_sub(self.current_epoch);
        if advanced > 0 {
            self.current_epoch = optimizer.epoch();
            optimizer.set_learning_rate(self.scheduler.lr_at(self.current_epoch));
        }

        Ok(advanced)
    }
}

/// Re-creates the learning rate scheduler whenever the optimizer instance is replaced.
pub struct SchedulerRebinder {
    factory: Option<SchedulerFactory>,
    rebinds: u64,
}

impl fmt::Debug for SchedulerRebinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRebinder")
            .field("factory", &self.factory.is_some())
            .field("rebinds", &self.rebinds)
            .finish()
    }
}

impl SchedulerRebinder {
    /// Creates a new `SchedulerRebinder`.
    ///
    /// # Arguments
    /// * `factory` - The scheduler factory, required when rounds replace the optimizer.
    pub fn new(factory: Option<SchedulerFactory>) -> Self {
        Self {
            factory,
            rebinds: 0,
        }
    }

    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    /// Amount of times a scheduler was rebound to a replaced optimizer.
    pub fn rebinds(&self) -> u64 {
        self.rebinds
    }

    /// Builds the scheduler for `new_optimizer` from the old factory.
    ///
    /// # Arguments
    /// * `factory` - The factory the previous scheduler was built with.
    /// * `new_optimizer` - The optimizer instance that replaced the previous one.
    ///
    /// # Returns
    /// The bound scheduler, or `MissingFactory` if there is nothing to rebuild it from.
    pub fn rebind_with(
        factory: Option<&SchedulerFactory>,
        new_optimizer: &mut OptimizerHandle,
    ) -> Result<EpochSyncedScheduler, RebindError> {
        let factory = factory.ok_or(RebindError::MissingFactory)?;
        let scheduler = factory(&*new_optimizer);
        Ok(EpochSyncedScheduler::bind(scheduler, new_optimizer))
    }

    /// Binds the initial scheduler, this doesn't count as a rebind.
    pub fn bind(
        &self,
        optimizer: &mut OptimizerHandle,
    ) -> Result<EpochSyncedScheduler, RebindError> {
        Self::rebind_with(self.factory.as_ref(), optimizer)
    }

    /// Rebinds after a round replaced the optimizer.
    pub fn rebind(
        &mut self,
        new_optimizer: &mut OptimizerHandle,
    ) -> Result<EpochSyncedScheduler, RebindError> {
        let scheduler = Self::rebind_with(self.factory.as_ref(), new_optimizer)?;
        self.rebinds += 1;
        debug!(generation = new_optimizer.generation(); "scheduler rebound to new optimizer");
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimization::GradientDescent,
        scheduling::{ExponentialLr, StepLr},
    };

    fn handle() -> OptimizerHandle {
        OptimizerHandle::new(vec![0.0], GradientDescent::new(1.0))
    }

    fn factory() -> SchedulerFactory {
        Arc::new(|_: &OptimizerHandle| Box::new(ExponentialLr::new(1.0, 0.5)) as Box<dyn LrScheduler>)
    }

    #[test]
    fn only_advances_with_epochs() {
        let mut opt = handle();
        let mut sched = EpochSyncedScheduler::bind(Box::new(StepLr::new(1.0, 1, 0.5)), &mut opt);

        assert_eq!(sched.step(&mut opt).unwrap(), 0);
        assert_eq!(opt.learning_rate(), 1.0);

        opt.apply_gradient(&[0.0]).unwrap();
        opt.apply_gradient(&[0.0]).unwrap();
        assert_eq!(sched.step(&mut opt).unwrap(), 2);
        assert_eq!(opt.learning_rate(), 0.25);
        assert_eq!(sched.current_epoch(), 2);
    }

    #[test]
    fn catching_up_jumps_to_the_adopted_epoch() {
        let mut opt = handle();
        let mut sched = EpochSyncedScheduler::bind(Box::new(ExponentialLr::new(1.0, 0.5)), &mut opt);

        opt.adopt(5, &[3.0]).unwrap();
        assert_eq!(sched.step(&mut opt).unwrap(), 5);
        assert_eq!(sched.current_epoch(), 5);
        assert_eq!(opt.learning_rate(), 0.5f32.powi(5));
        assert_eq!(sched.step(&mut opt).unwrap(), 0);
    }

    #[test]
    fn stale_binding_is_rejected() {
        let mut opt = handle();
        let mut sched = EpochSyncedScheduler::bind(Box::new(ExponentialLr::new(1.0, 0.5)), &mut opt);

        let mut replaced = opt.replace();
        assert_eq!(
            sched.step(&mut replaced).unwrap_err(),
            RebindError::StaleOptimizer {
                bound: 0,
                current: 1
            }
        );
    }

    #[test]
    fn rebind_requires_factory() {
        let mut opt = handle();
        let mut rebinder = SchedulerRebinder::new(None);
        assert_eq!(
            rebinder.rebind(&mut opt).unwrap_err(),
            RebindError::MissingFactory
        );
        assert_eq!(rebinder.rebinds(), 0);
    }

    #[test]
    fn rebind_continues_schedule_on_new_instance() {
        let mut opt = handle();
        let mut rebinder = SchedulerRebinder::new(Some(factory()));
        let _initial = rebinder.bind(&mut opt).unwrap();

        opt.apply_gradient(&[0.0]).unwrap();
        let mut replaced = opt.replace();
        let mut sched = rebinder.rebind(&mut replaced).unwrap();

        assert_eq!(rebinder.rebinds(), 1);
        assert_eq!(sched.generation(), 1);
        assert_eq!(replaced.learning_rate(), 0.5);
        assert_eq!(sched.step(&mut replaced).unwrap(), 0);
    }
}
