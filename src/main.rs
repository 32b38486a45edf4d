use std::{env, num::NonZeroU64, sync::Arc};

use anyhow::Context;
use collab_averaging::{
    CoordinatorBuilder, CoordinatorConfig, CoordinatorError, StepOutcome,
    optimization::{Adam, GradientDescentWithMomentum},
    scheduling::{ExponentialLr, LrScheduler},
    transport::{PeerId, TcpTransport},
};
use log::{info, warn};
use rand::Rng;
use tokio::signal;

const DEFAULT_TARGET_BATCH_SIZE: u64 = 32;
const DEFAULT_STEPS: usize = 500;
const MICRO_BATCH: u64 = 4;
const LEARNING_RATE: f32 = 0.05;
const TARGET: [f32; 4] = [1.0, -2.0, 0.5, 3.0];

/// Gradient of `||w - target||^2` with some noise standing in for a sampled micro-batch.
fn toy_gradient(params: &[f32], rng: &mut impl Rng) -> Vec<f32> {
    params
        .iter()
        .zip(TARGET)
        .map(|(w, t)| 2. * (w - t) + rng.random_range(-0.1..0.1))
        .collect()
}

fn load_config() -> anyhow::Result<CoordinatorConfig> {
    let mut config = match env::args().nth(1) {
        Some(path) => CoordinatorConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => CoordinatorConfig::new(NonZeroU64::new(DEFAULT_TARGET_BATCH_SIZE).context("zero target batch size")?),
    };

    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = load_config()?;
    let steps = match env::var("STEPS") {
        Ok(steps) => steps.parse().context("STEPS must be a positive integer")?,
        Err(_) => DEFAULT_STEPS,
    };
    let peer = env::var("PEER_ID").map(PeerId::new).unwrap_or_else(|_| PeerId::random());

    let params = vec![0.; TARGET.len()];
    let builder = CoordinatorBuilder::new(config.clone());
    let builder = match env::var("OPTIMIZER").as_deref() {
        Ok("momentum") | Err(_) => {
            builder.optimizer(params, GradientDescentWithMomentum::new(TARGET.len(), LEARNING_RATE, 0.9))
        }
        Ok("adam") => builder.optimizer(params, Adam::with_learning_rate(TARGET.len(), LEARNING_RATE)),
        Ok(other) => anyhow::bail!("unknown OPTIMIZER {other:?}, expected \"momentum\" or \"adam\""),
    };
    let builder =
        builder.scheduler_fn(|_| Box::new(ExponentialLr::new(LEARNING_RATE, 0.99)) as Box<dyn LrScheduler>);

    // Fail on bad options before binding any socket.
    builder.validate()?;

    let transport = Arc::new(TcpTransport::bind(peer, &config).await?);
    let mut coordinator = builder.build(Arc::clone(&transport))?;
    coordinator.start().await?;

    for (peer, addrs) in transport.peer_addrs() {
        info!(peer = peer.as_str(); "linked to {}", addrs.join(", "));
    }

    let mut rng = rand::rng();
    let train = async {
        for _ in 0..steps {
            let grad = toy_gradient(coordinator.parameters(), &mut rng);
            match coordinator.step(&grad, MICRO_BATCH).await {
                Ok(StepOutcome::Stepped { epoch, peers, .. }) => {
                    info!(epoch = epoch, peers = peers; "global step");
                }
                Ok(_) => {}
                Err(e) if e.is_recoverable() => warn!("{e}"),
                Err(e) => return Err(e),
            }
        }

        coordinator.wait_round().await.map(|_| ())
    };

    let trained = tokio::select! {
        res = train => res,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, leaving the run");
            Ok(())
        }
    };

    match trained {
        Ok(()) | Err(CoordinatorError::Cancelled) => {}
        Err(e) => return Err(e.into()),
    }

    coordinator.stop().await?;
    println!("epoch {}: {:?}", coordinator.epoch(), coordinator.parameters());

    Ok(())
}
