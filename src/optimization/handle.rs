use std::fmt;

use super::Optimizer;
use crate::error::{CoordinatorError, Result};

/// Owns the model parameters together with the optimizer that updates them.
///
/// The coordinator keeps the handle for the whole run and only lends it to the training
/// loop between rounds. Delayed rounds move the handle into a background task and hand
/// back a replacement with a new generation: `replace` consumes the old handle, so a
/// stale instance can't be used afterwards, and anything keyed on the generation (like a
/// bound scheduler) has to be rebound.
pub struct OptimizerHandle {
    generation: u64,
    epoch: u64,
    parameters: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
}

impl fmt::Debug for OptimizerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizerHandle")
            .field("generation", &self.generation)
            .field("epoch", &self.epoch)
            .field("params", &self.parameters.len())
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish()
    }
}

impl OptimizerHandle {
    /// Creates a new `OptimizerHandle` of generation 0 at epoch 0.
    ///
    /// # Arguments
    /// * `parameters` - The initial parameters of the model.
    /// * `optimizer` - The optimization algorithm.
    pub fn new<O: Optimizer + 'static>(parameters: Vec<f32>, optimizer: O) -> Self {
        Self {
            generation: 0,
            epoch: 0,
            parameters,
            optimizer: Box::new(optimizer),
        }
    }

    /// Identifies this optimizer instance, bumped every time the instance is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Amount of collective optimizer steps applied so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn parameters(&self) -> &[f32] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    /// Overwrites the parameters with the averaged state of the round.
    pub(crate) fn load_parameters(&mut self, parameters: &[f32]) -> Result<()> {
        if parameters.len() != self.parameters.len() {
            return Err(CoordinatorError::SizeMismatch {
                what: "parameters",
                got: parameters.len(),
                expected: self.parameters.len(),
            });
        }

        self.parameters.copy_from_slice(parameters);
        Ok(())
    }

    /// Applies the averaged gradient and advances the epoch.
    pub(crate) fn apply_gradient(&mut self, grad: &[f32]) -> Result<()> {
        self.optimizer.update_params(grad, &mut self.parameters)?;
        self.epoch += 1;
        Ok(())
    }

    /// Jumps to a state fetched from a peer that is ahead.
    pub(crate) fn adopt(&mut self, epoch: u64, parameters: &[f32]) -> Result<()> {
        self.load_parameters(parameters)?;
        self.epoch = epoch;
        Ok(())
    }

    /// Consumes this handle and returns the instance that replaces it.
    ///
    /// Parameters, epoch and the optimizer's hyperparameter state carry over, only the
    /// generation changes.
    pub fn replace(self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self
        }
    }

    /// Checks that something bound to `generation` still refers to this instance.
    ///
    /// # Returns
    /// `StaleHandle` if `generation` belongs to an instance that was replaced.
    pub fn ensure_generation(&self, generation: u64) -> Result<()> {
        if generation != self.generation {
            return Err(CoordinatorError::StaleHandle {
                generation,
                current: self.generation,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::GradientDescentWithMomentum;

    #[test]
    fn replace_bumps_generation_and_keeps_state() {
        let mut handle = OptimizerHandle::new(vec![0.0], GradientDescentWithMomentum::new(1, 1.0, 0.5));
        handle.apply_gradient(&[1.0]).unwrap();
        assert_eq!(handle.parameters(), &[-1.0]);

        let mut replaced = handle.replace();
        assert_eq!(replaced.generation(), 1);
        assert_eq!(replaced.epoch(), 1);

        // Momentum survived the replacement.
        replaced.apply_gradient(&[1.0]).unwrap();
        assert_eq!(replaced.parameters(), &[-2.5]);
        assert_eq!(replaced.epoch(), 2);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let handle = OptimizerHandle::new(vec![0.0], GradientDescentWithMomentum::new(1, 1.0, 0.5));
        let replaced = handle.replace();
        assert!(replaced.ensure_generation(1).is_ok());
        assert!(matches!(
            replaced.ensure_generation(0),
            Err(CoordinatorError::StaleHandle {
                generation: 0,
                current: 1
            })
        ));
    }

    #[test]
    fn load_parameters_checks_length() {
        let mut handle = OptimizerHandle::new(vec![0.0; 3], GradientDescentWithMomentum::new(3, 1.0, 0.5));
        assert!(handle.load_parameters(&[1.0]).is_err());
        handle.load_parameters(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(handle.parameters(), &[1.0, 2.0, 3.0]);
    }
}
