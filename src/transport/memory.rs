use std::{collections::HashMap, io, sync::Arc, time::Duration};

use log::debug;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

use super::{PeerId, PeerTransport, ProgressReport, StateSnapshot};
use crate::averaging::Contribution;

#[derive(Debug, Default)]
struct Member {
    online: bool,
    progress: Option<ProgressReport>,
    state: Option<StateSnapshot>,
    /// Contributions sent to this member, by epoch and sender.
    mailbox: HashMap<u64, HashMap<PeerId, Contribution>>,
}

#[derive(Debug)]
struct Swarm {
    members: Mutex<HashMap<PeerId, Member>>,
    changed: watch::Sender<u64>,
}

/// A set of peers living in the same process, connected through shared memory.
///
/// Every member sees every other online member, a disconnected member stops
/// receiving contributions and is treated as unreachable by the rest.
#[derive(Debug, Clone)]
pub struct MemorySwarm {
    inner: Arc<Swarm>,
}

impl Default for MemorySwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySwarm {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Swarm {
                members: Mutex::new(HashMap::new()),
                changed,
            }),
        }
    }

    /// Adds `peer` to the swarm, or brings it back online if it left.
    pub fn join(&self, peer: PeerId) -> MemoryTransport {
        self.inner
            .members
            .lock()
            .entry(peer.clone())
            .or_default()
            .online = true;
        self.notify();

        debug!(peer = peer.as_str(); "joined memory swarm");
        MemoryTransport {
            swarm: self.clone(),
            local: peer,
        }
    }

    /// Takes `peer` offline, simulating a crash or a network partition.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(member) = self.inner.members.lock().get_mut(peer) {
            member.online = false;
            member.progress = None;
            member.mailbox.clear();
        }
        self.notify();
    }

    /// The peers currently online, sorted.
    pub fn online(&self) -> Vec<PeerId> {
        let members = self.inner.members.lock();
        let mut peers: Vec<_> = members
            .iter()
            .filter(|(_, m)| m.online)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// One member's view of a `MemorySwarm`.
#[derive(Debug)]
pub struct MemoryTransport {
    swarm: MemorySwarm,
    local: PeerId,
}

impl MemoryTransport {
    pub fn swarm(&self) -> &MemorySwarm {
        &self.swarm
    }

    fn others<R>(&self, f: impl FnMut((&PeerId, &Member)) -> Option<R>) -> Vec<R> {
        let members = self.swarm.inner.members.lock();
        members
            .iter()
            .filter(|(p, m)| m.online && **p != self.local)
            .filter_map(f)
            .collect()
    }

    fn offline() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "peer left the swarm")
    }
}

impl PeerTransport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn visible_addrs(&self) -> Vec<String> {
        vec![format!("memory://{}", self.local)]
    }

    fn reachable_peers(&self) -> Vec<PeerId> {
        let mut peers = self.others(|(p, _)| Some(p.clone()));
        peers.sort();
        peers
    }

    fn peer_progress(&self) -> Vec<ProgressReport> {
        self.others(|(_, m)| m.progress.clone())
    }

    async fn publish_progress(&self, report: ProgressReport) -> io::Result<()> {
        {
            let mut members = self.swarm.inner.members.lock();
            let member = members
                .get_mut(&self.local)
                .filter(|m| m.online)
                .ok_or_else(Self::offline)?;
            member.progress = Some(report);
        }

        self.swarm.notify();
        Ok(())
    }

    async fn exchange(
        &self,
        contribution: Contribution,
        expected: Vec<PeerId>,
        timeout: Duration,
    ) -> io::Result<Vec<Contribution>> {
        let epoch = contribution.epoch;
        let deadline = Instant::now() + timeout;
        let mut changed = self.swarm.inner.changed.subscribe();

        {
            let mut members = self.swarm.inner.members.lock();
            if !members.get(&self.local).is_some_and(|m| m.online) {
                return Err(Self::offline());
            }

            for (peer, member) in members.iter_mut() {
                if *peer == self.local {
                    member.mailbox.retain(|e, _| *e >= epoch);
                } else if member.online {
                    member
                        .mailbox
                        .entry(epoch)
                        .or_default()
                        .insert(self.local.clone(), contribution.clone());
                }
            }
        }
        self.swarm.notify();

        loop {
            let done = {
                let members = self.swarm.inner.members.lock();
                let received = members
                    .get(&self.local)
                    .and_then(|m| m.mailbox.get(&epoch));

                expected.iter().all(|peer| {
                    let answered = received.is_some_and(|r| r.contains_key(peer));
                    let gone = !members.get(peer).is_some_and(|m| m.online);
                    answered || gone
                })
            };

            if done {
                break;
            }

            tokio::select! {
                res = changed.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let mut members = self.swarm.inner.members.lock();
        let received = members
            .get_mut(&self.local)
            .and_then(|m| m.mailbox.remove(&epoch))
            .unwrap_or_default();

        Ok(received.into_values().collect())
    }

    async fn publish_state(&self, snapshot: StateSnapshot) -> io::Result<()> {
        let mut members = self.swarm.inner.members.lock();
        let member = members
            .get_mut(&self.local)
            .filter(|m| m.online)
            .ok_or_else(Self::offline)?;
        member.state = Some(snapshot);
        Ok(())
    }

    async fn fetch_state(&self, _timeout: Duration) -> io::Result<Option<StateSnapshot>> {
        let states = self.others(|(_, m)| m.state.clone());
        Ok(states.into_iter().max_by(|a, b| {
            a.epoch.cmp(&b.epoch).then_with(|| b.peer.cmp(&a.peer))
        }))
    }

    async fn shutdown(&self) {
        self.swarm.disconnect(&self.local);
        debug!(peer = self.local.as_str(); "left memory swarm");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(peer: &str, epoch: u64) -> Contribution {
        Contribution {
            peer: PeerId::new(peer),
            run_id: "run".into(),
            epoch,
            samples: 1,
            gradient: vec![0.0],
            parameters: None,
        }
    }

    fn assert_transport<T: PeerTransport>(_: &T) {}

    #[tokio::test]
    async fn members_see_each_other() {
        let swarm = MemorySwarm::new();
        let a = swarm.join(PeerId::new("a"));
        let b = swarm.join(PeerId::new("b"));
        assert_transport(&a);

        assert_eq!(a.reachable_peers(), vec![PeerId::new("b")]);
        b.publish_progress(ProgressReport::now(PeerId::new("b"), "run", 0, 5))
            .await
            .unwrap();
        assert_eq!(a.peer_progress().len(), 1);

        swarm.disconnect(&PeerId::new("b"));
        assert!(a.reachable_peers().is_empty());
        assert!(a.peer_progress().is_empty());
        assert!(b.publish_progress(ProgressReport::now(PeerId::new("b"), "run", 0, 5)).await.is_err());
    }

    #[tokio::test]
    async fn exchange_waits_for_expected_peers() {
        let swarm = MemorySwarm::new();
        let a = swarm.join(PeerId::new("a"));
        let b = swarm.join(PeerId::new("b"));
        let timeout = Duration::from_secs(5);

        let (ra, rb) = tokio::join!(
            a.exchange(contribution("a", 2), vec![PeerId::new("b")], timeout),
            b.exchange(contribution("b", 2), vec![PeerId::new("a")], timeout),
        );

        assert_eq!(ra.unwrap(), vec![contribution("b", 2)]);
        assert_eq!(rb.unwrap(), vec![contribution("a", 2)]);
    }

    #[tokio::test]
    async fn disconnect_ends_the_wait() {
        let swarm = MemorySwarm::new();
        let a = swarm.join(PeerId::new("a"));
        let _b = swarm.join(PeerId::new("b"));

        let leaver = swarm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            leaver.disconnect(&PeerId::new("b"));
        });

        let received = a
            .exchange(contribution("a", 0), vec![PeerId::new("b")], Duration::from_secs(30))
            .await
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn fetches_freshest_state() {
        let swarm = MemorySwarm::new();
        let a = swarm.join(PeerId::new("a"));
        let b = swarm.join(PeerId::new("b"));
        let c = swarm.join(PeerId::new("c"));

        for (t, epoch) in [(&b, 3), (&c, 7)] {
            t.publish_state(StateSnapshot {
                peer: t.local_peer().clone(),
                run_id: "run".into(),
                epoch,
                parameters: vec![epoch as f32],
            })
            .await
            .unwrap();
        }

        let state = a.fetch_state(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(state.epoch, 7);
        assert_eq!(state.peer, PeerId::new("c"));
    }
}
