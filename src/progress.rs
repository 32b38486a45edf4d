use std::{collections::HashMap, time::Duration};

use log::debug;

use crate::transport::{PeerId, ProgressReport};

/// Keeps the last known progress of every peer of the run.
///
/// Peer contributions can't be observed before a round starts, this is the best
/// estimate the step gate gets. Reports from other runs and reports older than the
/// expiration are ignored.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    run_id: String,
    local: PeerId,
    expiration: Duration,
    peers: HashMap<PeerId, ProgressReport>,
}

impl ProgressTracker {
    /// Creates a new `ProgressTracker`.
    ///
    /// # Arguments
    /// * `run_id` - Only reports of this run are tracked.
    /// * `local` - The local peer, its own reports are skipped.
    /// * `expiration` - How old a report may be before it stops counting.
    pub fn new(run_id: impl Into<String>, local: PeerId, expiration: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            local,
            expiration,
            peers: HashMap::new(),
        }
    }

    /// Replaces the tracked reports with the transport's latest view.
    ///
    /// Peers missing from `reports` are no longer reachable and are forgotten.
    pub fn refresh(&mut self, reports: Vec<ProgressReport>) {
        let run_id = &self.run_id;
        let local = &self.local;
        let expiration = self.expiration;

        let peers: HashMap<_, _> = reports
            .into_iter()
            .filter(|r| &r.peer != local)
            .filter(|r| {
                let same_run = &r.run_id == run_id;
                if !same_run {
                    debug!(peer = r.peer.as_str(); "ignoring progress of another run");
                }
                same_run
            })
            .filter(|r| r.age() <= expiration)
            .map(|r| (r.peer.clone(), r))
            .collect();

        self.peers = peers;
    }

    /// Sum of the samples peers reported for `epoch`.
    pub fn estimate(&self, epoch: u64) -> u64 {
        self.peers
            .values()
            .filter(|r| r.epoch == epoch)
            .fold(0u64, |acc, r| acc.saturating_add(r.samples))
    }

    /// The highest epoch reported by a peer, if it's ahead of `epoch`.
    pub fn ahead_of(&self, epoch: u64) -> Option<u64> {
        self.peers.values().map(|r| r.epoch).filter(|e| *e > epoch).max()
    }

    /// Amount of processes in the run, including this one.
    pub fn num_peers(&self) -> usize {
        self.peers.len() + 1
    }

    /// The peers currently tracked, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.peers.keys().cloned().collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::unix_millis;

    fn report(peer: &str, run: &str, epoch: u64, samples: u64) -> ProgressReport {
        ProgressReport::now(PeerId::new(peer), run, epoch, samples)
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new("run", PeerId::new("me"), Duration::from_secs(60))
    }

    #[test]
    fn estimates_only_matching_epoch() {
        let mut tracker = tracker();
        tracker.refresh(vec![
            report("a", "run", 3, 40),
            report("b", "run", 3, 15),
            report("c", "run", 2, 90),
        ]);

        assert_eq!(tracker.estimate(3), 55);
        assert_eq!(tracker.estimate(2), 90);
        assert_eq!(tracker.num_peers(), 4);
        assert_eq!(tracker.ahead_of(2), Some(3));
        assert_eq!(tracker.ahead_of(3), None);
    }

    #[test]
    fn skips_self_other_runs_and_expired() {
        let mut tracker = tracker();
        let mut stale = report("old", "run", 0, 10);
        stale.sent_at_ms = unix_millis() - 120_000;

        tracker.refresh(vec![
            report("me", "run", 0, 10),
            report("x", "other", 0, 10),
            stale,
            report("ok", "run", 0, 7),
        ]);

        assert_eq!(tracker.estimate(0), 7);
        assert_eq!(tracker.peers(), vec![PeerId::new("ok")]);
    }

    #[test]
    fn forgets_unreachable_peers() {
        let mut tracker = tracker();
        tracker.refresh(vec![report("a", "run", 0, 10)]);
        tracker.refresh(Vec::new());
        assert_eq!(tracker.num_peers(), 1);
        assert_eq!(tracker.estimate(0), 0);
    }
}
