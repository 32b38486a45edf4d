/// A learning rate schedule over collective optimizer steps.
pub trait LrScheduler: Send {
    /// The learning rate to use after `epoch` collective steps.
    fn lr_at(&self, epoch: u64) -> f32;
}

impl<T: LrScheduler + ?Sized> LrScheduler for Box<T> {
    fn lr_at(&self, epoch: u64) -> f32 {
        (**self).lr_at(epoch)
    }
}

/// Decays the learning rate by `gamma` every epoch.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialLr {
    base_lr: f32,
    gamma: f32,
}

impl ExponentialLr {
    pub fn new(base_lr: f32, gamma: f32) -> Self {
        Self { base_lr, gamma }
    }
}

impl LrScheduler for ExponentialLr {
    fn lr_at(&self, epoch: u64) -> f32 {
        self.base_lr * self.gamma.powi(epoch.min(i32::MAX as u64) as i32)
    }
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    base_lr: f32,
    step_size: u64,
    gamma: f32,
}

impl StepLr {
    /// Creates a new `StepLr`, a `step_size` of 0 is treated as 1.
    pub fn new(base_lr: f32, step_size: u64, gamma: f32) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
        }
    }
}

impl LrScheduler for StepLr {
    fn lr_at(&self, epoch: u64) -> f32 {
        let decays = (epoch / self.step_size).min(i32::MAX as u64) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_decay() {
        let s = ExponentialLr::new(1.0, 0.5);
        assert_eq!(s.lr_at(0), 1.0);
        assert_eq!(s.lr_at(3), 0.125);
    }

    #[test]
    fn step_decay() {
        let s = StepLr::new(1.0, 2, 0.5);
        assert_eq!(s.lr_at(0), 1.0);
        assert_eq!(s.lr_at(1), 1.0);
        assert_eq!(s.lr_at(2), 0.5);
        assert_eq!(s.lr_at(5), 0.25);
    }
}
