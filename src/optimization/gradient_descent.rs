use super::{Optimizer, check_len};
use crate::error::Result;

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;

        let lr = self.learning_rate;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_against_gradient() {
        let mut opt = GradientDescent::new(0.5);
        let mut params = [1.0, -1.0];
        opt.update_params(&[2.0, -4.0], &mut params).unwrap();
        assert_eq!(params, [0.0, 1.0]);
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut opt = GradientDescent::new(0.5);
        let mut params = [1.0];
        assert!(opt.update_params(&[1.0, 2.0], &mut params).is_err());
    }
}
