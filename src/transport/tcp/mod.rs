mod codec;

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use codec::{Control, Msg, MsgReceiver, MsgSender, channel};

use super::{PeerId, PeerTransport, ProgressReport, StateSnapshot};
use crate::{averaging::Contribution, config::CoordinatorConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Link {
    id: u64,
    addrs: Vec<String>,
    tx: mpsc::UnboundedSender<Arc<Msg>>,
}

#[derive(Debug)]
struct Shared {
    local: PeerId,
    run_id: String,
    visible: Vec<String>,
    links: Mutex<HashMap<PeerId, Link>>,
    progress: Mutex<HashMap<PeerId, ProgressReport>>,
    mailbox: Mutex<HashMap<u64, HashMap<PeerId, Contribution>>>,
    state: Mutex<Option<StateSnapshot>>,
    state_replies: Mutex<HashMap<PeerId, Option<StateSnapshot>>>,
    changed: watch::Sender<u64>,
    cancel: CancellationToken,
    next_link: AtomicU64,
}

impl Shared {
    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn hello(&self) -> Msg {
        Msg::Control(Control::Hello {
            peer: self.local.clone(),
            run_id: self.run_id.clone(),
            addrs: self.visible.clone(),
        })
    }

    fn broadcast(&self, msg: Msg) {
        let msg = Arc::new(msg);
        for link in self.links.lock().values() {
            let _ = link.tx.send(Arc::clone(&msg));
        }
    }

    fn send_to(&self, peer: &PeerId, msg: Msg) {
        if let Some(link) = self.links.lock().get(peer) {
            let _ = link.tx.send(Arc::new(msg));
        }
    }

    /// Forgets `peer` unless its link was already replaced by a newer connection.
    fn drop_link(&self, peer: &PeerId, id: u64) {
        {
            let mut links = self.links.lock();
            if !links.get(peer).is_some_and(|l| l.id == id) {
                return;
            }
            links.remove(peer);
        }

        self.progress.lock().remove(peer);
        self.notify();
    }

    /// Handles one message from `peer`.
    ///
    /// # Returns
    /// False once the peer said goodbye.
    fn handle(&self, peer: &PeerId, msg: Msg) -> bool {
        match msg {
            Msg::Control(Control::Progress(report)) => {
                self.progress.lock().insert(peer.clone(), report);
            }
            Msg::Contribution(contribution) => {
                self.mailbox
                    .lock()
                    .entry(contribution.epoch)
                    .or_default()
                    .insert(peer.clone(), contribution);
            }
            Msg::Control(Control::StateRequest) => {
                let state = self.state.lock().clone();
                self.send_to(peer, Msg::Control(Control::State(state)));
            }
            Msg::Control(Control::State(state)) => {
                self.state_replies.lock().insert(peer.clone(), state);
            }
            Msg::Control(Control::Disconnect) => return false,
            Msg::Control(Control::Hello { .. }) => {
                debug!(peer = peer.as_str(); "ignoring repeated hello");
            }
            Msg::Err(e) => warn!(peer = peer.as_str(); "peer reported an error: {e}"),
        }

        self.notify();
        true
    }
}

/// Reaches peers over plain tcp connections.
///
/// Connections are made to every `initial_peers` address on bind and accepted on every
/// `host_addrs` address afterwards. A peer that dials in is reachable as long as its
/// connection stays open.
#[derive(Debug)]
pub struct TcpTransport {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl TcpTransport {
    /// Binds the listeners and dials the initial peers.
    ///
    /// Unreachable initial peers are logged and skipped.
    ///
    /// # Arguments
    /// * `local` - This process' identifier.
    /// * `config` - Provides the run id and the addresses to listen on and to dial.
    ///
    /// # Returns
    /// An io error if none of the host addresses could be bound.
    pub async fn bind(local: PeerId, config: &CoordinatorConfig) -> io::Result<Self> {
        let mut listeners = Vec::new();
        let mut visible = Vec::new();

        for addr in &config.host_addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    visible.push(listener.local_addr()?.to_string());
                    listeners.push(listener);
                }
                Err(e) => warn!(addr = addr.as_str(); "failed to bind: {e}"),
            }
        }

        if listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "none of the host addresses could be bound",
            ));
        }

        let (changed, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            local,
            run_id: config.run_id.clone(),
            visible,
            links: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            mailbox: Mutex::new(HashMap::new()),
            state: Mutex::new(None),
            state_replies: Mutex::new(HashMap::new()),
            changed,
            cancel: CancellationToken::new(),
            next_link: AtomicU64::new(0),
        });

        info!(peer = shared.local.as_str(); "listening on {}", shared.visible.join(", "));

        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(accept_loop(listener, Arc::clone(&shared)));
        }

        let dials = config.initial_peers.iter().map(|addr| dial(addr, &shared));
        for link in future::join_all(dials).await.into_iter().flatten() {
            tasks.spawn(read_loop(link, Arc::clone(&shared)));
        }

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// The addresses every linked peer announced, sorted by peer.
    pub fn peer_addrs(&self) -> Vec<(PeerId, Vec<String>)> {
        let mut addrs: Vec<_> = self
            .shared
            .links
            .lock()
            .iter()
            .map(|(p, l)| (p.clone(), l.addrs.clone()))
            .collect();
        addrs.sort();
        addrs
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut readers = JoinSet::new();

    loop {
        let stream = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {addr}");
                    stream
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            },
        };

        let shared = Arc::clone(&shared);
        readers.spawn(async move {
            match handshake(stream, &shared, false).await {
                Ok(link) => read_loop(link, shared).await,
                Err(e) => warn!("incoming handshake failed: {e}"),
            }
        });
    }

    readers.shutdown().await;
}

/// The receiving side of a registered link.
struct Inbound {
    peer: PeerId,
    id: u64,
    rx: MsgReceiver<OwnedReadHalf>,
}

/// Connects to an initial peer, failures are logged and skipped.
async fn dial(addr: &str, shared: &Arc<Shared>) -> Option<Inbound> {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(addr = addr; "failed to connect: {e}");
            return None;
        }
        Err(_) => {
            warn!(addr = addr; "timed out connecting");
            return None;
        }
    };

    handshake(stream, shared, true)
        .await
        .inspect_err(|e| warn!(addr = addr; "handshake failed: {e}"))
        .ok()
}

/// Exchanges hellos and registers the link.
///
/// When two peers dial each other at once both sides keep the connection dialed by the
/// smaller peer id.
///
/// # Arguments
/// * `stream` - The freshly established connection.
/// * `shared` - The transport state the link is registered in.
/// * `dialed` - Whether this side initiated the connection.
///
/// # Returns
/// The receiving end of the connection, the sending end is owned by a writer task fed
/// through the link.
async fn handshake(stream: TcpStream, shared: &Arc<Shared>, dialed: bool) -> io::Result<Inbound> {
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = channel(rx, tx);

    tx.send(&shared.hello()).await?;
    let msg = tokio::time::timeout(CONNECT_TIMEOUT, rx.recv())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello received"))??;

    let Msg::Control(Control::Hello { peer, run_id, addrs }) = msg else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected a hello as first message",
        ));
    };

    if run_id != shared.run_id {
        let _ = tx
            .send(&Msg::Err(format!("run {run_id} doesn't match {}", shared.run_id)))
            .await;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer {peer} belongs to run {run_id}"),
        ));
    }

    if peer == shared.local {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "connected to ourselves",
        ));
    }

    let preferred = if dialed {
        shared.local < peer
    } else {
        peer < shared.local
    };

    let id = shared.next_link.fetch_add(1, Ordering::Relaxed);
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    {
        let mut links = shared.links.lock();
        if links.contains_key(&peer) && !preferred {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("already linked to {peer}"),
            ));
        }
        links.insert(
            peer.clone(),
            Link {
                id,
                addrs: addrs.clone(),
                tx: link_tx,
            },
        );
    }

    tokio::spawn(write_loop(tx, link_rx));
    debug!(peer = peer.as_str(); "linked to {}", addrs.join(", "));
    shared.notify();

    Ok(Inbound { peer, id, rx })
}

async fn write_loop(mut tx: MsgSender<OwnedWriteHalf>, mut rx: mpsc::UnboundedReceiver<Arc<Msg>>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = tx.send(&msg).await {
            debug!("writer stopped: {e}");
            break;
        }
    }
}

async fn read_loop(inbound: Inbound, shared: Arc<Shared>) {
    let Inbound { peer, id, mut rx } = inbound;

    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = rx.recv() => res,
        };

        match msg {
            Ok(msg) => {
                if !shared.handle(&peer, msg) {
                    debug!(peer = peer.as_str(); "peer disconnected");
                    break;
                }
            }
            Err(e) => {
                warn!(peer = peer.as_str(); "lost connection: {e}");
                break;
            }
        }
    }

    shared.drop_link(&peer, id);
}

impl PeerTransport for TcpTransport {
    fn local_peer(&self) -> &PeerId {
        &self.shared.local
    }

    fn visible_addrs(&self) -> Vec<String> {
        self.shared.visible.clone()
    }

    fn reachable_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.shared.links.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn peer_progress(&self) -> Vec<ProgressReport> {
        let links = self.shared.links.lock();
        self.shared
            .progress
            .lock()
            .iter()
            .filter(|(p, _)| links.contains_key(*p))
            .map(|(_, r)| r.clone())
            .collect()
    }

    async fn publish_progress(&self, report: ProgressReport) -> io::Result<()> {
        self.shared.broadcast(Msg::Control(Control::Progress(report)));
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
        let mut changed = self.shared.changed.subscribe();

        self.shared.mailbox.lock().retain(|e, _| *e >= epoch);
        self.shared.broadcast(Msg::Contribution(contribution));

        loop {
            let done = {
                let links = self.shared.links.lock();
                let mailbox = self.shared.mailbox.lock();
                let received = mailbox.get(&epoch);

                expected.iter().all(|peer| {
                    received.is_some_and(|r| r.contains_key(peer)) || !links.contains_key(peer)
                })
            };

            if done {
                break;
            }

            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                res = changed.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let received = self.shared.mailbox.lock().remove(&epoch).unwrap_or_default();
        Ok(received.into_values().collect())
    }

    async fn publish_state(&self, snapshot: StateSnapshot) -> io::Result<()> {
        *self.shared.state.lock() = Some(snapshot);
        Ok(())
    }

    async fn fetch_state(&self, timeout: Duration) -> io::Result<Option<StateSnapshot>> {
        let deadline = Instant::now() + timeout;
        let mut changed = self.shared.changed.subscribe();

        self.shared.state_replies.lock().clear();
        self.shared.broadcast(Msg::Control(Control::StateRequest));

        loop {
            let done = {
                let links = self.shared.links.lock();
                let replies = self.shared.state_replies.lock();
                links.keys().all(|p| replies.contains_key(p))
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

        let replies = std::mem::take(&mut *self.shared.state_replies.lock());
        let run_id = &self.shared.run_id;
        Ok(replies
            .into_values()
            .flatten()
            .filter(|s| &s.run_id == run_id)
            .max_by(|a, b| a.epoch.cmp(&b.epoch).then_with(|| b.peer.cmp(&a.peer))))
    }

    async fn shutdown(&self) {
        self.shared.broadcast(Msg::Control(Control::Disconnect));
        self.shared.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}

        self.shared.links.lock().clear();
        self.shared.progress.lock().clear();
        self.shared.notify();
        info!(peer = self.shared.local.as_str(); "left the run");
    }
}
