use std::{net::SocketAddr, sync::Arc};

use log::{debug, info, warn};

use crate::{
    accumulation::{GradientBuffer, LocalAccumulator},
    averaging::{AveragingMode, PeerAverager, RoundHandle, RoundPayload, RoundReport},
    config::{CoordinatorConfig, INITIAL_PEERS_ENV},
    error::{CoordinatorError, RebindError, Result},
    gate::{FailureAction, GatePhase, StepGate},
    optimization::{Optimizer, OptimizerHandle},
    progress::ProgressTracker,
    scheduling::{EpochSyncedScheduler, LrScheduler, SchedulerFactory, SchedulerRebinder},
    transport::{PeerId, PeerTransport, ProgressReport, StateSnapshot},
};

/// What a call to `step` or `poll` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The threshold wasn't reached, `samples` are waiting for the next round.
    Accumulated { samples: u64 },
    /// A delayed round was dispatched to the background.
    RoundStarted { round: u64, epoch: u64 },
    /// A round committed, the optimizer is now at `epoch`.
    Stepped { epoch: u64, peers: usize, samples: u64 },
    /// Retries were exhausted and the local accumulation was dropped.
    Restarted { failures: u32 },
}

/// Builds a `Coordinator`, validating every option before anything touches the network.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    optimizer: Option<OptimizerHandle>,
    scheduler: Option<Box<dyn LrScheduler>>,
    scheduler_fn: Option<SchedulerFactory>,
}

impl CoordinatorBuilder {
    /// Creates a new `CoordinatorBuilder`.
    ///
    /// # Arguments
    /// * `config` - The options of the run.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            optimizer: None,
            scheduler: None,
            scheduler_fn: None,
        }
    }

    /// Sets the initial parameters and the optimizer that updates them.
    pub fn optimizer<O: Optimizer + 'static>(mut self, parameters: Vec<f32>, optimizer: O) -> Self {
        self.optimizer = Some(OptimizerHandle::new(parameters, optimizer));
        self
    }

    /// Sets a scheduler bound once to the initial optimizer.
    ///
    /// Only valid in synchronous mode, delayed rounds replace the optimizer and need
    /// `scheduler_fn` instead.
    pub fn scheduler<S: LrScheduler + 'static>(mut self, scheduler: S) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Sets the factory used to build a scheduler for every optimizer instance.
    pub fn scheduler_fn<F>(mut self, factory: F) -> Self
    where
        F: Fn(&OptimizerHandle) -> Box<dyn LrScheduler> + Send + Sync + 'static,
    {
        self.scheduler_fn = Some(Arc::new(factory));
        self
    }

    /// Checks the configuration together with the optimizer and scheduler choices.
    ///
    /// # Errors
    /// `ConfigurationConflict` for invalid option combinations, `Rebind(MissingFactory)`
    /// if a delayed mode is enabled without a `scheduler_fn`.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;

        let Some(optimizer) = &self.optimizer else {
            return Err(CoordinatorError::ConfigurationConflict(
                "an optimizer and the initial parameters are required".into(),
            ));
        };

        if optimizer.is_empty() {
            return Err(CoordinatorError::ConfigurationConflict(
                "the model has no parameters".into(),
            ));
        }

        if self.scheduler.is_some() && self.scheduler_fn.is_some() {
            return Err(CoordinatorError::ConfigurationConflict(
                "set either a scheduler or a scheduler_fn, not both".into(),
            ));
        }

        if self.config.any_delay() {
            if self.scheduler.is_some() {
                return Err(CoordinatorError::ConfigurationConflict(
                    "delayed averaging replaces the optimizer every round, a pre-built scheduler \
                     would stay bound to the first instance, use scheduler_fn"
                        .into(),
                ));
            }

            if self.scheduler_fn.is_none() {
                return Err(RebindError::MissingFactory.into());
            }
        }

        Ok(())
    }

    /// Validates the options and assembles the coordinator on top of `transport`.
    pub fn build<T>(self, transport: Arc<T>) -> Result<Coordinator<T>>
    where
        T: PeerTransport + Send + Sync + 'static,
    {
        self.validate()?;

        let Self {
            config,
            optimizer,
            scheduler,
            scheduler_fn,
        } = self;

        let Some(mut optimizer) = optimizer else {
            return Err(CoordinatorError::ConfigurationConflict(
                "an optimizer and the initial parameters are required".into(),
            ));
        };

        let rebinder = SchedulerRebinder::new(scheduler_fn);
        let scheduler = match scheduler {
            Some(scheduler) => Some(EpochSyncedScheduler::bind(scheduler, &mut optimizer)),
            None if rebinder.has_factory() => Some(rebinder.bind(&mut optimizer)?),
            None => None,
        };

        let mode = if config.any_delay() {
            AveragingMode::Delayed
        } else {
            AveragingMode::Synchronous
        };

        let local = transport.local_peer().clone();
        let averager = PeerAverager::new(Arc::clone(&transport), config.run_id.clone(), config.round_timeout);
        let gate = StepGate::new(
            config.target_batch_size,
            config.max_round_retries,
            config.on_round_failure,
        );
        let progress = ProgressTracker::new(config.run_id.clone(), local, config.progress_expiration);
        let gradients = GradientBuffer::new(optimizer.len());
        let snapshot = optimizer.parameters().to_vec();

        Ok(Coordinator {
            config,
            mode,
            transport,
            averager,
            gate,
            accumulator: LocalAccumulator::new(),
            gradients,
            progress,
            snapshot,
            snapshot_epoch: 0,
            optimizer: Some(optimizer),
            in_flight: None,
            scheduler,
            rebinder,
            lifecycle: Lifecycle::Created,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Drives collaborative training for one process.
///
/// The training loop calls `step` once per micro-batch. Samples accumulate locally until
/// the local count plus what peers reported reaches the target batch size, then a round
/// averages the gradients with every reachable peer and steps the optimizer.
///
/// In delayed mode the round runs in the background: until it commits, `parameters`
/// keeps returning the state the round started from, so local steps between the start
/// and the completion of round N use the result of round N-1.
pub struct Coordinator<T> {
    config: CoordinatorConfig,
    mode: AveragingMode,
    transport: Arc<T>,
    averager: PeerAverager<T>,
    gate: StepGate,
    accumulator: LocalAccumulator,
    gradients: GradientBuffer,
    progress: ProgressTracker,
    snapshot: Vec<f32>,
    snapshot_epoch: u64,
    optimizer: Option<OptimizerHandle>,
    in_flight: Option<RoundHandle>,
    scheduler: Option<EpochSyncedScheduler>,
    rebinder: SchedulerRebinder,
    lifecycle: Lifecycle,
}

impl<T> Coordinator<T>
where
    T: PeerTransport + Send + Sync + 'static,
{
    /// Joins the run: announces how to reach this process, catches up with peers that
    /// are already ahead and publishes the local state.
    pub async fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(CoordinatorError::Cancelled),
            Lifecycle::Created => {}
        }

        self.announce_addrs();

        self.progress.refresh(self.transport.peer_progress());
        if !self.transport.reachable_peers().is_empty() {
            self.load_state_from_peers().await?;
        }

        self.lifecycle = Lifecycle::Running;
        self.publish_state().await;
        self.publish_progress().await;

        info!(
            peer = self.transport.local_peer().as_str(),
            peers = self.num_peers(),
            epoch = self.epoch();
            "coordinator started"
        );
        Ok(())
    }

    /// Records a local micro-batch and runs a round if the target is believed reached.
    ///
    /// # Arguments
    /// * `grad` - The mean gradient of the micro-batch.
    /// * `samples` - The amount of samples in the micro-batch.
    ///
    /// # Errors
    /// `InvalidContribution` for an empty micro-batch, `RoundFailed` if a round got no
    /// answer (the contribution is kept for the next one) and `Aborted` once the retry
    /// policy gives up.
    pub async fn step(&mut self, grad: &[f32], samples: u64) -> Result<StepOutcome> {
        self.ensure_running().await?;

        if self.gate.phase() == GatePhase::Aborted {
            return Err(CoordinatorError::Aborted {
                round: self.gate.crossings(),
                failures: self.gate.failures(),
            });
        }

        if samples == 0 {
            return Err(CoordinatorError::InvalidContribution { samples });
        }

        self.gradients.accumulate(grad, samples)?;
        self.accumulator.record(samples)?;

        let harvested = self.harvest().await?;
        self.publish_progress().await;

        let outcome = self.try_round().await?;
        Ok(prefer(harvested, outcome))
    }

    /// Re-checks the threshold against the latest peer progress without recording samples.
    ///
    /// Lets a process that already accumulated join a round its peers started, and
    /// collects a finished delayed round.
    pub async fn poll(&mut self) -> Result<StepOutcome> {
        self.ensure_running().await?;

        let harvested = self.harvest().await?;
        let outcome = self.try_round().await?;
        Ok(prefer(harvested, outcome))
    }

    /// Waits for the round in flight, if any, and commits it.
    pub async fn wait_round(&mut self) -> Result<StepOutcome> {
        match self.in_flight.take() {
            Some(handle) => {
                let report = self.averager.await_result(handle).await?;
                self.finish_round(report).await
            }
            None => Ok(StepOutcome::Accumulated {
                samples: self.accumulator.pending(),
            }),
        }
    }

    /// Adopts the freshest state a peer published if it's ahead of the local one.
    ///
    /// The local accumulation belongs to an epoch that is already gone, so it's dropped.
    ///
    /// # Returns
    /// True if a peer's state was adopted.
    pub async fn load_state_from_peers(&mut self) -> Result<bool> {
        if self.in_flight.is_some() {
            return Ok(false);
        }

        let fetched = self.transport.fetch_state(self.config.round_timeout).await?;
        let Some(state) = fetched else {
            return Ok(false);
        };

        if !self.adopt(state)? {
            return Ok(false);
        }

        self.publish_state().await;
        self.publish_progress().await;
        Ok(true)
    }

    /// Leaves the run, cancelling the round in flight.
    ///
    /// A cancelled round gives its frozen contribution back to the accumulator.
    pub async fn stop(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }

        self.averager.cancel_all();

        let mut result = Ok(());
        if let Some(handle) = self.in_flight.take() {
            handle.cancel();
            result = match self.averager.await_result(handle).await {
                Ok(report) => match self.finish_round(report).await {
                    Ok(_) | Err(CoordinatorError::Cancelled) => Ok(()),
                    Err(e) if e.is_recoverable() => Ok(()),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
        }

        self.transport.shutdown().await;
        self.lifecycle = Lifecycle::Stopped;
        info!(epoch = self.epoch(); "coordinator stopped");
        result
    }

    /// The parameters the training loop should use for its next micro-batch.
    pub fn parameters(&self) -> &[f32] {
        match &self.optimizer {
            Some(optimizer) => optimizer.parameters(),
            None => &self.snapshot,
        }
    }

    /// Amount of collective optimizer steps applied to `parameters`.
    pub fn epoch(&self) -> u64 {
        self.optimizer
            .as_ref()
            .map_or(self.snapshot_epoch, OptimizerHandle::epoch)
    }

    /// Amount of processes believed to be in the run, including this one.
    pub fn num_peers(&self) -> usize {
        self.progress.num_peers()
    }

    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer()
    }

    pub fn accumulator(&self) -> &LocalAccumulator {
        &self.accumulator
    }

    pub fn phase(&self) -> GatePhase {
        self.gate.phase()
    }

    pub fn mode(&self) -> AveragingMode {
        self.mode
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The optimizer, lent to the caller between rounds only.
    pub fn optimizer(&self) -> Option<&OptimizerHandle> {
        self.optimizer.as_ref()
    }

    pub fn learning_rate(&self) -> Option<f32> {
        self.optimizer.as_ref().map(OptimizerHandle::learning_rate)
    }

    pub fn is_round_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Amount of times the scheduler was rebound to a replaced optimizer.
    pub fn rebinds(&self) -> u64 {
        self.rebinder.rebinds()
    }

    async fn ensure_running(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Created => self.start().await,
            Lifecycle::Running => Ok(()),
            Lifecycle::Stopped => Err(CoordinatorError::Cancelled),
        }
    }

    /// The epoch the next round will average.
    fn next_epoch(&self) -> u64 {
        match &self.in_flight {
            Some(handle) => handle.epoch() + 1,
            None => self.epoch(),
        }
    }

    async fn try_round(&mut self) -> Result<StepOutcome> {
        self.progress.refresh(self.transport.peer_progress());

        let next_epoch = self.next_epoch();
        let behind = self.in_flight.is_none() && self.progress.ahead_of(next_epoch).is_some();
        if behind && self.load_state_from_peers().await? {
            return Ok(StepOutcome::Accumulated { samples: 0 });
        }

        let local = self.accumulator.pending();
        let peers = self.progress.estimate(self.next_epoch());
        if !self.gate.should_step(local, peers) {
            return Ok(StepOutcome::Accumulated { samples: local });
        }

        if let Some(handle) = self.in_flight.take() {
            debug!(round = handle.round(); "waiting for the round in flight");
            let report = self.averager.await_result(handle).await?;
            self.finish_round(report).await?;
        }

        self.begin_round().await
    }

    async fn begin_round(&mut self) -> Result<StepOutcome> {
        let Some(optimizer) = self.optimizer.take() else {
            return Err(CoordinatorError::ConfigurationConflict(
                "a round is already in flight, only one round at a time is allowed".into(),
            ));
        };

        if let Err(e) = self.gate.begin_round() {
            self.optimizer = Some(optimizer);
            return Err(e);
        }

        let samples = self.accumulator.freeze();
        let gradient = self.gradients.freeze(samples);
        let epoch = optimizer.epoch();
        let parameters = (epoch % self.config.average_state_every.get() == 0)
            .then(|| optimizer.parameters().to_vec());

        self.snapshot.clear();
        self.snapshot.extend_from_slice(optimizer.parameters());
        self.snapshot_epoch = epoch;

        let payload = RoundPayload {
            gradient,
            parameters,
            samples,
        };

        let handle = self.averager.start_round(payload, optimizer, self.mode).await;
        match handle {
            RoundHandle::Ready(report) => self.finish_round(report).await,
            handle => {
                let (round, epoch) = (handle.round(), handle.epoch());
                self.in_flight = Some(handle);
                Ok(StepOutcome::RoundStarted { round, epoch })
            }
        }
    }

    /// Collects a delayed round if it already finished, never waits.
    async fn harvest(&mut self) -> Result<Option<StepOutcome>> {
        if !self.in_flight.as_ref().is_some_and(RoundHandle::is_finished) {
            return Ok(None);
        }

        let Some(handle) = self.in_flight.take() else {
            return Ok(None);
        };

        let report = self.averager.await_result(handle).await?;
        self.finish_round(report).await.map(Some)
    }

    async fn finish_round(&mut self, report: RoundReport) -> Result<StepOutcome> {
        let RoundReport {
            round,
            epoch,
            optimizer,
            outcome,
        } = report;
        self.optimizer = Some(optimizer);

        let summary = match outcome {
            Ok(summary) => summary,
            Err(CoordinatorError::Cancelled) => {
                self.gate.cancel_round(&mut self.accumulator);
                self.gradients.restore();
                return Err(CoordinatorError::Cancelled);
            }
            Err(e) if e.is_recoverable() => {
                self.gradients.restore();
                return match self.gate.fail_round(&mut self.accumulator)? {
                    FailureAction::Retry { failures } => {
                        warn!(round = round, epoch = epoch, failures = failures; "{e}, keeping the contribution for the next round");
                        Err(e)
                    }
                    FailureAction::Restarted { failures } => {
                        self.gradients.clear();
                        self.publish_progress().await;
                        Ok(StepOutcome::Restarted { failures })
                    }
                };
            }
            Err(e) => {
                self.gate.cancel_round(&mut self.accumulator);
                self.gradients.restore();
                return Err(e);
            }
        };

        self.gate.complete_round(&mut self.accumulator);
        self.gradients.reset();
        self.rebind_scheduler(summary.replaced)?;

        self.publish_state().await;
        self.publish_progress().await;

        Ok(StepOutcome::Stepped {
            epoch: self.epoch(),
            peers: summary.participants.len(),
            samples: summary.samples,
        })
    }

    /// Rebinds the scheduler to a replaced optimizer, or advances it with the epoch.
    fn rebind_scheduler(&mut self, replaced: bool) -> Result<()> {
        let Some(optimizer) = self.optimizer.as_mut() else {
            return Ok(());
        };

        if replaced {
            self.scheduler = Some(self.rebinder.rebind(optimizer)?);
        } else if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step(optimizer)?;
        }

        Ok(())
    }

    fn adopt(&mut self, state: StateSnapshot) -> Result<bool> {
        let Some(optimizer) = self.optimizer.as_mut() else {
            return Ok(false);
        };

        if state.run_id != self.config.run_id || state.epoch <= optimizer.epoch() {
            return Ok(false);
        }

        if state.parameters.len() != optimizer.len() {
            warn!(peer = state.peer.as_str(); "peer state has {} parameters, expected {}", state.parameters.len(), optimizer.len());
            return Ok(false);
        }

        let behind = optimizer.epoch();
        optimizer.adopt(state.epoch, &state.parameters)?;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step(optimizer)?;
        }

        self.accumulator.clear();
        self.gradients.clear();

        info!(peer = state.peer.as_str(), from = behind, to = state.epoch; "caught up with peer state");
        Ok(true)
    }

    fn local_state(&self) -> Option<StateSnapshot> {
        let optimizer = self.optimizer.as_ref()?;
        Some(StateSnapshot {
            peer: self.transport.local_peer().clone(),
            run_id: self.config.run_id.clone(),
            epoch: optimizer.epoch(),
            parameters: optimizer.parameters().to_vec(),
        })
    }

    fn progress_report(&self) -> ProgressReport {
        ProgressReport::now(
            self.transport.local_peer().clone(),
            self.config.run_id.clone(),
            self.next_epoch(),
            self.accumulator.pending(),
        )
    }

    async fn publish_state(&mut self) {
        let state = self.local_state();
        publish_state(&*self.transport, state).await;
    }

    async fn publish_progress(&mut self) {
        let report = self.progress_report();
        publish_progress(&*self.transport, report).await;
    }

    fn announce_addrs(&self) {
        let Announced { addrs, wildcard_ports } = announced(self.transport.visible_addrs());
        for port in wildcard_ports {
            warn!(
                port = port;
                "listening on all interfaces, other machines must dial one of this host's addresses on port {port}"
            );
        }

        if addrs.is_empty() {
            return;
        }

        if self.config.initial_peers.is_empty() {
            info!(
                "to join this run from another machine set {INITIAL_PEERS_ENV}={} or use \"initial_peers\": {:?} in its config",
                addrs.join(","),
                addrs
            );
        } else {
            info!("reachable at {}", addrs.join(", "));
        }
    }
}

async fn publish_state<T: PeerTransport>(transport: &T, state: Option<StateSnapshot>) {
    let Some(state) = state else {
        return;
    };

    if let Err(e) = transport.publish_state(state).await {
        warn!("failed to publish state: {e}");
    }
}

async fn publish_progress<T: PeerTransport>(transport: &T, report: ProgressReport) {
    if let Err(e) = transport.publish_progress(report).await {
        warn!("failed to publish progress: {e}");
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Announced {
    addrs: Vec<String>,
    wildcard_ports: Vec<u16>,
}

/// Splits the listen addresses into the ones other machines can dial as they are and the
/// ports bound on the unspecified address. Loopback addresses are dropped.
fn announced(visible: Vec<String>) -> Announced {
    let mut addrs = Vec::new();
    let mut wildcard_ports = Vec::new();

    for addr in visible {
        match addr.parse::<SocketAddr>() {
            Ok(sock) if sock.ip().is_loopback() => {}
            Ok(sock) if sock.ip().is_unspecified() => wildcard_ports.push(sock.port()),
            _ => addrs.push(addr),
        }
    }

    Announced {
        addrs,
        wildcard_ports,
    }
}

/// A harvested round outcome is only worth reporting if nothing newer happened.
fn prefer(harvested: Option<StepOutcome>, outcome: StepOutcome) -> StepOutcome {
    match (harvested, outcome) {
        (Some(harvested), StepOutcome::Accumulated { .. }) => harvested,
        (_, outcome) => outcome,
    }
}
