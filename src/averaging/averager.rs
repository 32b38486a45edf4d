use std::{collections::HashSet, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Contribution, RoundPayload, weighted_average};
use crate::{
    error::{CoordinatorError, Result},
    optimization::OptimizerHandle,
    transport::{PeerId, PeerTransport},
};

/// Whether the optimizer waits for the round or the round runs in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AveragingMode {
    /// The round completes before `start_round` returns, the optimizer instance is kept.
    Synchronous,
    /// The round runs in a background task and the optimizer is replaced when it commits.
    Delayed,
}

/// What a successful round did.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    /// Every peer whose contribution was merged, the local one included.
    pub participants: Vec<PeerId>,
    /// Expected peers that didn't answer in time or sent an invalid contribution.
    pub excluded: Vec<PeerId>,
    pub samples: u64,
    /// True if the optimizer instance was replaced by the commit.
    pub replaced: bool,
}

/// The result of a round, successful or not, together with the optimizer it borrowed.
#[derive(Debug)]
pub struct RoundReport {
    pub round: u64,
    pub epoch: u64,
    pub optimizer: OptimizerHandle,
    pub outcome: Result<RoundSummary>,
}

/// A round that was started, possibly still in flight.
#[derive(Debug)]
pub enum RoundHandle {
    Ready(RoundReport),
    Pending {
        round: u64,
        epoch: u64,
        cancel: CancellationToken,
        task: JoinHandle<RoundReport>,
    },
}

impl RoundHandle {
    pub fn round(&self) -> u64 {
        match self {
            Self::Ready(report) => report.round,
            Self::Pending { round, .. } => *round,
        }
    }

    /// The epoch the round is averaging.
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Ready(report) => report.epoch,
            Self::Pending { epoch, .. } => *epoch,
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Self::Ready(_) => true,
            Self::Pending { task, .. } => task.is_finished(),
        }
    }

    /// Interrupts the round, its report comes back with a `Cancelled` outcome and an
    /// untouched optimizer.
    pub fn cancel(&self) {
        if let Self::Pending { cancel, .. } = self {
            cancel.cancel();
        }
    }
}

/// Runs collective rounds: exchanges the local contribution, re-validates what peers sent
/// and commits the weighted average to the optimizer.
pub struct PeerAverager<T> {
    transport: Arc<T>,
    run_id: String,
    timeout: Duration,
    next_round: u64,
    cancel: CancellationToken,
}

impl<T> PeerAverager<T>
where
    T: PeerTransport + Send + Sync + 'static,
{
    /// Creates a new `PeerAverager`.
    ///
    /// # Arguments
    /// * `transport` - How to reach the other peers of the run.
    /// * `run_id` - Contributions of other runs are dropped.
    /// * `timeout` - How long a round waits for the expected peers.
    pub fn new(transport: Arc<T>, run_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            run_id: run_id.into(),
            timeout,
            next_round: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts a round for the epoch `optimizer` is at.
    ///
    /// The optimizer is moved into the round and comes back in its report: in synchronous
    /// mode the returned handle is already `Ready`, in delayed mode the round runs in a
    /// background task until it's awaited.
    ///
    /// # Arguments
    /// * `payload` - The local mean gradient, samples and optionally parameters.
    /// * `optimizer` - The optimizer the merged result is committed to.
    /// * `mode` - Whether to wait for the round.
    pub async fn start_round(
        &mut self,
        payload: RoundPayload,
        optimizer: OptimizerHandle,
        mode: AveragingMode,
    ) -> RoundHandle {
        let round = self.next_round;
        self.next_round += 1;

        let epoch = optimizer.epoch();
        let local = self.transport.local_peer().clone();
        let contribution = Contribution::from_payload(local, self.run_id.clone(), epoch, payload);

        let mut expected = self.transport.reachable_peers();
        expected.sort();

        debug!(round = round, epoch = epoch, peers = expected.len(); "starting averaging round");

        let round_task = RoundTask {
            transport: Arc::clone(&self.transport),
            round,
            timeout: self.timeout,
            contribution,
            expected,
            mode,
        };
        let cancel = self.cancel.child_token();

        match mode {
            AveragingMode::Synchronous => RoundHandle::Ready(round_task.run(optimizer, cancel).await),
            AveragingMode::Delayed => {
                let token = cancel.clone();
                let task = tokio::spawn(round_task.run(optimizer, token));
                RoundHandle::Pending {
                    round,
                    epoch,
                    cancel,
                    task,
                }
            }
        }
    }

    /// Waits for the round of `handle` to finish.
    ///
    /// # Returns
    /// The round's report, or `Join` if the background task panicked and the optimizer
    /// it held is lost.
    pub async fn await_result(&self, handle: RoundHandle) -> Result<RoundReport> {
        match handle {
            RoundHandle::Ready(report) => Ok(report),
            RoundHandle::Pending { task, .. } => task
                .await
                .map_err(|e| CoordinatorError::Join(e.to_string())),
        }
    }

    /// Cancels every round in flight and any round started afterwards.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }
}

struct RoundTask<T> {
    transport: Arc<T>,
    round: u64,
    timeout: Duration,
    contribution: Contribution,
    expected: Vec<PeerId>,
    mode: AveragingMode,
}

impl<T> RoundTask<T>
where
    T: PeerTransport + Send + Sync + 'static,
{
    async fn run(self, optimizer: OptimizerHandle, cancel: CancellationToken) -> RoundReport {
        let RoundTask {
            transport,
            round,
            timeout,
            contribution,
            expected,
            mode,
        } = self;
        let epoch = contribution.epoch;

        let report = |optimizer: OptimizerHandle, outcome: Result<RoundSummary>| RoundReport {
            round,
            epoch,
            optimizer,
            outcome,
        };

        if cancel.is_cancelled() {
            return report(optimizer, Err(CoordinatorError::Cancelled));
        }

        let exchanged = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(round = round; "round cancelled");
                return report(optimizer, Err(CoordinatorError::Cancelled));
            }
            res = transport.exchange(contribution.clone(), expected.clone(), timeout) => res,
        };

        let received = match exchanged {
            Ok(received) => received,
            Err(e) => {
                warn!(round = round, epoch = epoch; "exchange with {} failed: {e}", peer_names(&expected));
                return report(optimizer, Err(round_failed(round, epoch, expected)));
            }
        };

        let valid = revalidate(&contribution, received);
        if valid.is_empty() {
            // Peers that left mid-round don't count, with nobody left the round is local.
            let reachable = transport.reachable_peers();
            let silent: Vec<_> = expected.iter().filter(|p| reachable.contains(*p)).cloned().collect();
            if !silent.is_empty() {
                warn!(
                    round = round,
                    epoch = epoch;
                    "round failed, no valid contribution from {} before the timeout",
                    peer_names(&silent)
                );
                return report(optimizer, Err(round_failed(round, epoch, silent)));
            }
        }

        let excluded: Vec<_> = expected
            .iter()
            .filter(|p| !valid.iter().any(|c| &c.peer == *p))
            .cloned()
            .collect();
        if !excluded.is_empty() {
            warn!(round = round, epoch = epoch; "completing round without {}", peer_names(&excluded));
        }

        let mut contributions = valid;
        contributions.push(contribution);

        let Some(merged) = weighted_average(&contributions) else {
            return report(optimizer, Err(round_failed(round, epoch, expected)));
        };

        let mut optimizer = optimizer;
        if let Err(e) = commit(&mut optimizer, merged.parameters.as_deref(), &merged.gradient) {
            return report(optimizer, Err(e));
        }

        let replaced = mode == AveragingMode::Delayed;
        if replaced {
            optimizer = optimizer.replace();
        }

        info!(
            round = round,
            epoch = optimizer.epoch(),
            peers = merged.participants.len(),
            samples = merged.samples;
            "round committed with {}",
            peer_names(&merged.participants)
        );

        let summary = RoundSummary {
            participants: merged.participants,
            excluded,
            samples: merged.samples,
            replaced,
        };
        report(optimizer, Ok(summary))
    }
}

/// Loads the averaged state, if any, then steps with the averaged gradient.
fn commit(optimizer: &mut OptimizerHandle, parameters: Option<&[f32]>, gradient: &[f32]) -> Result<()> {
    if let Some(parameters) = parameters {
        optimizer.load_parameters(parameters)?;
    }
    optimizer.apply_gradient(gradient)
}

fn peer_names(peers: &[PeerId]) -> String {
    peers.iter().map(PeerId::as_str).collect::<Vec<_>>().join(", ")
}

fn round_failed(round: u64, epoch: u64, expected: Vec<PeerId>) -> CoordinatorError {
    CoordinatorError::RoundFailed {
        round,
        epoch,
        expected,
    }
}

/// Drops every received contribution that can't be merged with the local one.
///
/// The threshold check only used progress estimates, this is where a peer that
/// advanced, restarted, belongs to another run or sent garbage gets filtered out.
pub(crate) fn revalidate(local: &Contribution, received: Vec<Contribution>) -> Vec<Contribution> {
    let mut seen = HashSet::new();

    received
        .into_iter()
        .filter(|c| {
            let reason = if c.peer == local.peer {
                Some("sent by the local peer")
            } else if c.run_id != local.run_id {
                Some("belongs to another run")
            } else if c.epoch != local.epoch {
                Some("epoch mismatch")
            } else if c.samples == 0 {
                Some("no samples")
            } else if c.gradient.len() != local.gradient.len() {
                Some("gradient length mismatch")
            } else if c
                .parameters
                .as_ref()
                .is_some_and(|p| p.len() != local.gradient.len())
            {
                Some("parameters length mismatch")
            } else if !seen.insert(c.peer.clone()) {
                Some("duplicate")
            } else {
                None
            };

            if let Some(reason) = reason {
                debug!(peer = c.peer.as_str(), epoch = c.epoch; "dropping contribution: {reason}");
            }
            reason.is_none()
        })
        .collect()
}
