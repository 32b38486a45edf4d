use super::{Optimizer, check_len};
use crate::error::Result;

/// Adam with bias-corrected moments.
///
/// The moments and the step count live in the optimizer, so they carry over when a
/// delayed round replaces the `OptimizerHandle` and advance once per collective step,
/// never per local micro-batch.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    betas: (f32, f32),
    epsilon: f32,
    steps: i32,
    first_moment: Box<[f32]>,
    second_moment: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The step size before bias correction.
    /// * `betas` - Decay rates of the first and second moment estimates.
    /// * `epsilon` - Added to the denominator for numerical stability.
    pub fn new(len: usize, learning_rate: f32, betas: (f32, f32), epsilon: f32) -> Self {
        Self {
            learning_rate,
            betas,
            epsilon,
            steps: 0,
            first_moment: vec![0.; len].into_boxed_slice(),
            second_moment: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Adam with the usual `betas = (0.9, 0.999)` and `epsilon = 1e-8`.
    pub fn with_learning_rate(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, (0.9, 0.999), 1e-8)
    }

    /// Amount of updates applied so far.
    pub fn steps(&self) -> i32 {
        self.steps
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;
        check_len(grad, &self.first_moment)?;

        self.steps = self.steps.saturating_add(1);

        let (b1, b2) = self.betas;
        let eps = self.epsilon;
        let m_correction = 1. - b1.powi(self.steps);
        let v_correction = 1. - b2.powi(self.steps);
        let lr = self.learning_rate;

        let moments = self.first_moment.iter_mut().zip(self.second_moment.iter_mut());
        for ((p, g), (m, v)) in params.iter_mut().zip(grad).zip(moments) {
            *m = b1 * *m + (1. - b1) * g;
            *v = b2 * *v + (1. - b2) * g * g;

            let m_hat = *m / m_correction;
            let v_hat = *v / v_correction;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
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
    fn first_step_moves_by_learning_rate() {
        let mut opt = Adam::with_learning_rate(2, 0.1);
        let mut params = [1.0, 1.0];
        opt.update_params(&[0.5, -0.5], &mut params).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-4);
        assert!((params[1] - 1.1).abs() < 1e-4);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn gradient_size_is_checked() {
        let mut opt = Adam::with_learning_rate(2, 0.1);
        let mut params = [0.0; 3];
        assert!(opt.update_params(&[1.0; 3], &mut params).is_err());
        assert_eq!(opt.steps(), 0);
    }
}
