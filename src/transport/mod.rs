//! Peer transports used by the averager to reach other processes of the same run.
//!
//! Neither implementation discovers peers on its own: the memory transport sees every
//! member of its swarm, the tcp transport sees its `initial_peers` and whoever dials in.

mod memory;
mod tcp;

use std::{
    fmt, io,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::averaging::Contribution;

pub use memory::{MemorySwarm, MemoryTransport};
pub use tcp::TcpTransport;

/// Identifies a single process taking part in the run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a new `PeerId` from any string-like name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a random peer id, used when the caller doesn't name the process.
    pub fn random() -> Self {
        Self(format!("peer-{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer's announcement of how many samples it has accumulated toward `epoch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub peer: PeerId,
    pub run_id: String,
    pub epoch: u64,
    pub samples: u64,
    /// Unix time in milliseconds when the report was produced.
    pub sent_at_ms: u64,
}

impl ProgressReport {
    /// Creates a report stamped with the current wall clock time.
    pub fn now(peer: PeerId, run_id: impl Into<String>, epoch: u64, samples: u64) -> Self {
        Self {
            peer,
            run_id: run_id.into(),
            epoch,
            samples,
            sent_at_ms: unix_millis(),
        }
    }

    /// The age of this report relative to the local clock.
    pub fn age(&self) -> Duration {
        Duration::from_millis(unix_millis().saturating_sub(self.sent_at_ms))
    }
}

/// The latest committed training state of a peer, used to catch up late joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub peer: PeerId,
    pub run_id: String,
    pub epoch: u64,
    pub parameters: Vec<f32>,
}

/// Payload exchange, reachability and timeout primitives the averager depends on.
#[allow(unused)]
#[trait_variant::make(PeerTransport: Send)]
pub trait PeerTransportTemplate: Sync {
    /// This process' own identifier.
    fn local_peer(&self) -> &PeerId;

    /// Addresses other machines can use to join this process.
    fn visible_addrs(&self) -> Vec<String>;

    /// Peers that are currently reachable, never including the local peer.
    fn reachable_peers(&self) -> Vec<PeerId>;

    /// Latest progress report of every reachable peer.
    fn peer_progress(&self) -> Vec<ProgressReport>;

    /// Announces the local progress to every reachable peer.
    async fn publish_progress(&self, report: ProgressReport) -> io::Result<()>;

    /// Sends `contribution` to every reachable peer and collects the contributions of the
    /// same epoch sent by others.
    ///
    /// # Arguments
    /// * `contribution` - The local contribution to the round.
    /// * `expected` - The peers whose contributions are awaited.
    /// * `timeout` - How long to wait for the expected peers.
    ///
    /// # Returns
    /// Whatever contributions arrived before every expected peer answered or the timeout elapsed.
    async fn exchange(
        &self,
        contribution: Contribution,
        expected: Vec<PeerId>,
        timeout: Duration,
    ) -> io::Result<Vec<Contribution>>;

    /// Makes the local committed state available to peers that need to catch up.
    async fn publish_state(&self, snapshot: StateSnapshot) -> io::Result<()>;

    /// Fetches the freshest state any reachable peer has published.
    async fn fetch_state(&self, timeout: Duration) -> io::Result<Option<StateSnapshot>>;

    /// Leaves the swarm, peers stop seeing this process as reachable.
    async fn shutdown(&self);
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
