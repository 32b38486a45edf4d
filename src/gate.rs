use std::num::NonZeroU64;

use log::warn;

use crate::{
    accumulation::LocalAccumulator,
    config::FailurePolicy,
    error::{CoordinatorError, Result},
};

/// Optimistic threshold check run before every potential round.
///
/// The peers' share is only an estimate built from their last progress reports, the
/// averager re-validates the actual contributions before committing. With no peers the
/// estimate is zero and the local contribution alone has to reach the target.
///
/// # Arguments
/// * `local` - Samples accumulated by this process.
/// * `peers` - Best known estimate of the samples accumulated by the other peers.
/// * `target` - The collective target batch size.
pub fn should_step(local: u64, peers: u64, target: NonZeroU64) -> bool {
    local > 0 && local.saturating_add(peers) >= target.get()
}

/// The phase of the local process in the round lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Accumulating,
    Averaging,
    Aborted,
}

/// What the caller must do after a failed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep accumulating, the next threshold check starts a fresh round.
    Retry { failures: u32 },
    /// Retries were exhausted and the accumulation was dropped.
    Restarted { failures: u32 },
}

/// Decides, per local step, whether to only accumulate or to start a collective round.
#[derive(Debug, Clone)]
pub struct StepGate {
    target: NonZeroU64,
    phase: GatePhase,
    failures: u32,
    max_retries: u32,
    policy: FailurePolicy,
    crossings: u64,
}

impl StepGate {
    /// Creates a new `StepGate`.
    ///
    /// # Arguments
    /// * `target` - The collective target batch size.
    /// * `max_retries` - The amount of consecutive failed rounds tolerated.
    /// * `policy` - What to do once the retries are exhausted.
    pub fn new(target: NonZeroU64, max_retries: u32, policy: FailurePolicy) -> Self {
        Self {
            target,
            phase: GatePhase::Accumulating,
            failures: 0,
            max_retries,
            policy,
            crossings: 0,
        }
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn target(&self) -> NonZeroU64 {
        self.target
    }

    /// Consecutive failed rounds since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Amount of rounds started so far.
    pub fn crossings(&self) -> u64 {
        self.crossings
    }

    /// Threshold check against the gate's target, always false once aborted.
    pub fn should_step(&self, local: u64, peers: u64) -> bool {
        self.phase != GatePhase::Aborted && should_step(local, peers, self.target)
    }

    /// `ACCUMULATING -> AVERAGING`.
    ///
    /// # Returns
    /// `ConfigurationConflict` if a round is already in flight or the gate aborted.
    pub fn begin_round(&mut self) -> Result<()> {
        match self.phase {
            GatePhase::Accumulating => {
                self.phase = GatePhase::Averaging;
                self.crossings += 1;
                Ok(())
            }
            GatePhase::Averaging => Err(CoordinatorError::ConfigurationConflict(
                "a round is already in flight, only one round at a time is allowed".into(),
            )),
            GatePhase::Aborted => Err(CoordinatorError::Aborted {
                round: self.crossings,
                failures: self.failures,
            }),
        }
    }

    /// `AVERAGING -> ACCUMULATING` after a successful round, resetting the accumulator.
    pub fn complete_round(&mut self, accumulator: &mut LocalAccumulator) {
        accumulator.reset();
        self.failures = 0;
        self.phase = GatePhase::Accumulating;
    }

    /// Handles a failed or cancelled round, the frozen contribution is always restored first.
    ///
    /// # Returns
    /// The action taken, or `Aborted` when retries are exhausted under `FailurePolicy::Abort`.
    pub fn fail_round(&mut self, accumulator: &mut LocalAccumulator) -> Result<FailureAction> {
        accumulator.restore();
        self.failures += 1;

        if self.failures <= self.max_retries {
            self.phase = GatePhase::Accumulating;
            return Ok(FailureAction::Retry {
                failures: self.failures,
            });
        }

        let failures = self.failures;
        self.phase = GatePhase::Aborted;

        match self.policy {
            FailurePolicy::Abort => Err(CoordinatorError::Aborted {
                round: self.crossings,
                failures,
            }),
            FailurePolicy::Restart => {
                warn!(failures = failures; "retries exhausted, restarting accumulation from zero");
                accumulator.clear();
                self.failures = 0;
                self.phase = GatePhase::Accumulating;
                Ok(FailureAction::Restarted { failures })
            }
        }
    }

    /// Returns an interrupted round to accumulation without counting it as a failure.
    pub fn cancel_round(&mut self, accumulator: &mut LocalAccumulator) {
        accumulator.restore();
        if self.phase == GatePhase::Averaging {
            self.phase = GatePhase::Accumulating;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    #[test]
    fn threshold_combines_local_and_peers() {
        assert!(!should_step(60, 0, target(100)));
        assert!(!should_step(50, 49, target(100)));
        assert!(should_step(50, 50, target(100)));
        assert!(should_step(60, 50, target(100)));
        assert!(!should_step(0, 500, target(100)));
    }

    #[test]
    fn single_peer_needs_local_target() {
        assert!(should_step(100, 0, target(100)));
        assert!(should_step(u64::MAX, u64::MAX, target(100)));
    }

    #[test]
    fn transitions_once_per_crossing() {
        let mut gate = StepGate::new(target(10), 3, FailurePolicy::Restart);
        let mut acc = LocalAccumulator::new();
        let mut transitions = 0;

        for _ in 0..25 {
            acc.record(1).unwrap();
            if gate.should_step(acc.current(), 0) {
                gate.begin_round().unwrap();
                transitions += 1;
                acc.freeze();
                gate.complete_round(&mut acc);
                assert_eq!(acc.current(), 0);
            }
        }

        assert_eq!(transitions, 2);
        assert_eq!(gate.crossings(), 2);
        assert_eq!(acc.current(), 5);
    }

    #[test]
    fn single_flight() {
        let mut gate = StepGate::new(target(1), 0, FailurePolicy::Restart);
        gate.begin_round().unwrap();
        assert!(matches!(
            gate.begin_round(),
            Err(CoordinatorError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn failures_restore_then_abort() {
        let mut gate = StepGate::new(target(10), 1, FailurePolicy::Abort);
        let mut acc = LocalAccumulator::new();
        acc.record(12).unwrap();

        gate.begin_round().unwrap();
        acc.freeze();
        assert_eq!(
            gate.fail_round(&mut acc).unwrap(),
            FailureAction::Retry { failures: 1 }
        );
        assert_eq!(acc.current(), 12);
        assert_eq!(gate.phase(), GatePhase::Accumulating);

        gate.begin_round().unwrap();
        acc.freeze();
        assert!(matches!(
            gate.fail_round(&mut acc),
            Err(CoordinatorError::Aborted { failures: 2, .. })
        ));
        assert_eq!(gate.phase(), GatePhase::Aborted);
        assert_eq!(acc.current(), 12);
        assert!(!gate.should_step(acc.current(), 0));
    }

    #[test]
    fn restart_policy_clears_accumulation() {
        let mut gate = StepGate::new(target(10), 0, FailurePolicy::Restart);
        let mut acc = LocalAccumulator::new();
        acc.record(12).unwrap();

        gate.begin_round().unwrap();
        acc.freeze();
        assert_eq!(
            gate.fail_round(&mut acc).unwrap(),
            FailureAction::Restarted { failures: 1 }
        );
        assert_eq!(acc.current(), 0);
        assert_eq!(gate.phase(), GatePhase::Accumulating);
        assert_eq!(gate.failures(), 0);
    }
}
