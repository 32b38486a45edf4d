use crate::error::Result;

/// Defines the strategy for updating model parameters based on an averaged gradient.
pub trait Optimizer: Send {
    /// Updates the provided parameters using the collectively averaged gradient.
    ///
    /// # Arguments
    /// * `grad` - The gradient merged from every participant of the round.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `grad` and `params` differ in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// The learning rate used by the next update.
    fn learning_rate(&self) -> f32;

    /// Overrides the learning rate, this is what schedulers drive.
    fn set_learning_rate(&mut self, learning_rate: f32);
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        (**self).update_params(grad, params)
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        (**self).set_learning_rate(learning_rate)
    }
}
