use crate::error::{CoordinatorError, Result};

/// Tracks how many samples the local process has contributed toward the target batch size.
///
/// It keeps two counters in the same spirit as a double buffered gradient: samples
/// recorded since the last round go into the active counter, and starting a round freezes
/// them. The frozen count is only dropped once the round succeeds, a failed or cancelled
/// round gives it back to the active counter so no contribution is lost.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalAccumulator {
    active: u64,
    frozen: u64,
}

impl LocalAccumulator {
    /// Creates a new empty `LocalAccumulator`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the sample count of a local micro-batch. Never blocks.
    ///
    /// # Arguments
    /// * `samples` - The amount of samples in the micro-batch.
    ///
    /// # Returns
    /// `InvalidContribution` if `samples` is zero.
    pub fn record(&mut self, samples: u64) -> Result<()> {
        if samples == 0 {
            return Err(CoordinatorError::InvalidContribution { samples });
        }

        self.active = self.active.saturating_add(samples);
        Ok(())
    }

    /// Snapshot of every sample not yet committed by a successful round.
    pub fn current(&self) -> u64 {
        self.active + self.frozen
    }

    /// Samples recorded since the last round started.
    pub fn pending(&self) -> u64 {
        self.active
    }

    /// Samples handed to the round currently in flight.
    pub fn frozen(&self) -> u64 {
        self.frozen
    }

    /// Moves the active samples into the frozen counter.
    ///
    /// # Returns
    /// The amount of samples frozen for the round.
    pub fn freeze(&mut self) -> u64 {
        self.frozen += std::mem::take(&mut self.active);
        self.frozen
    }

    /// Zeroes the contribution committed by the last round.
    ///
    /// Only called once a round completes successfully.
    pub fn reset(&mut self) {
        self.frozen = 0;
    }

    /// Returns the frozen samples to the active counter after a failed round.
    pub fn restore(&mut self) {
        self.active += std::mem::take(&mut self.frozen);
    }

    /// Drops everything, used when restarting accumulation or adopting a peer's state.
    pub fn clear(&mut self) {
        self.active = 0;
        self.frozen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_rejects_empty_batches() {
        let mut acc = LocalAccumulator::new();
        assert!(matches!(
            acc.record(0),
            Err(CoordinatorError::InvalidContribution { samples: 0 })
        ));
        assert_eq!(acc.current(), 0);
    }

    #[test]
    fn freeze_then_reset_drops_committed_samples() {
        let mut acc = LocalAccumulator::new();
        acc.record(30).unwrap();
        acc.record(40).unwrap();
        assert_eq!(acc.freeze(), 70);

        acc.record(5).unwrap();
        assert_eq!(acc.current(), 75);
        assert_eq!(acc.pending(), 5);

        acc.reset();
        assert_eq!(acc.current(), 5);
    }

    #[test]
    fn restore_preserves_contribution() {
        let mut acc = LocalAccumulator::new();
        acc.record(60).unwrap();
        acc.freeze();
        acc.record(10).unwrap();

        acc.restore();
        assert_eq!(acc.frozen(), 0);
        assert_eq!(acc.pending(), 70);
        assert_eq!(acc.current(), 70);
    }
}
