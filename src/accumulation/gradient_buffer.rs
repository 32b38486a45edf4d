use crate::error::{CoordinatorError, Result};

/// Sample weighted gradient sums, double buffered like `LocalAccumulator`.
///
/// Every micro-batch gradient is scaled by its sample count before being summed, so
/// dividing the frozen sum by the frozen sample count yields the mean gradient over every
/// sample the process contributed to the round.
#[derive(Debug, Clone)]
pub struct GradientBuffer {
    active: Box<[f32]>,
    frozen: Box<[f32]>,
}

impl GradientBuffer {
    /// Creates a new `GradientBuffer`.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the model.
    pub fn new(len: usize) -> Self {
        Self {
            active: vec![0.; len].into_boxed_slice(),
            frozen: vec![0.; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Accumulates the mean gradient of a micro-batch of `samples` samples.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `grad` doesn't match the model size.
    pub fn accumulate(&mut self, grad: &[f32], samples: u64) -> Result<()> {
        self.check_len(grad.len())?;

        let weight = samples as f32;
        self.active
            .iter_mut()
            .zip(grad)
            .for_each(|(acc, g)| *acc += weight * g);

        Ok(())
    }

    /// Freezes the active sums and returns the mean gradient over `samples`.
    ///
    /// # Arguments
    /// * `samples` - The total amount of frozen samples, as returned by `LocalAccumulator::freeze`.
    pub fn freeze(&mut self, samples: u64) -> Vec<f32> {
        self.frozen
            .iter_mut()
            .zip(self.active.iter_mut())
            .for_each(|(f, a)| *f += std::mem::take(a));

        if samples == 0 {
            return vec![0.; self.frozen.len()];
        }

        let samples = samples as f32;
        self.frozen.iter().map(|g| g / samples).collect()
    }

    /// Drops the frozen sums once the round they were sent in succeeded.
    pub fn reset(&mut self) {
        self.frozen.fill(0.);
    }

    /// Gives the frozen sums back to the active buffer after a failed round.
    pub fn restore(&mut self) {
        self.active
            .iter_mut()
            .zip(self.frozen.iter_mut())
            .for_each(|(a, f)| *a += std::mem::take(f));
    }

    pub fn clear(&mut self) {
        self.active.fill(0.);
        self.frozen.fill(0.);
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.active.len() {
            return Err(CoordinatorError::SizeMismatch {
                what: "gradient",
                got,
                expected: self.active.len(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_returns_sample_weighted_mean() {
        let mut buf = GradientBuffer::new(2);
        buf.accumulate(&[1.0, 2.0], 10).unwrap();
        buf.accumulate(&[4.0, 8.0], 30).unwrap();

        let mean = buf.freeze(40);
        assert_eq!(mean, vec![3.25, 6.5]);
    }

    #[test]
    fn restore_then_freeze_keeps_old_sums() {
        let mut buf = GradientBuffer::new(1);
        buf.accumulate(&[2.0], 2).unwrap();
        buf.freeze(2);

        buf.accumulate(&[4.0], 2).unwrap();
        buf.restore();

        assert_eq!(buf.freeze(4), vec![3.0]);
    }

    #[test]
    fn rejects_wrong_length() {
        let mut buf = GradientBuffer::new(3);
        let err = buf.accumulate(&[1.0], 1).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::SizeMismatch {
                got: 1,
                expected: 3,
                ..
            }
        ));
    }
}
