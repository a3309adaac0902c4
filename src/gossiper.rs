//! The engine: control surface, main loop and the exchange drivers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use crate::cluster::{Cluster, PeerTracker, QuorumMonitor, TimerCommand};
use crate::node::{NodeId, NodeStatus, SelfStatus};
use crate::store::{GossipStore, MetaInfo, NodeInfo, StoreKey};
use crate::transport::{
    DiffPayload, InboundListener, MetaEnvelope, PeerConn, PeerLink, TransportError, WireMessage,
};

pub const DEFAULT_GOSSIP_VERSION: &str = "v1";
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUORUM_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time [Gossiper::stop] waits for the main loop itself, beyond the
/// grace granted to in-flight exchanges.
const STOP_SLACK: Duration = Duration::from_secs(1);

pub(crate) type SharedStore = Arc<RwLock<GossipStore>>;

/// The engine could not be started.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind gossip listener: {0}")]
    Listener(#[from] TransportError),
}

/// Why a single exchange was abandoned. Absorbed by the loop; the quorum
/// monitor only ever sees the aggregate effect of a shrinking reachable set.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("gossip version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("unexpected message during exchange")]
    UnexpectedMessage,
}

#[derive(Clone)]
pub(crate) struct GossiperConfig {
    pub self_addr: Url,
    pub node_id: NodeId,
    pub gossip_interval: Duration,
    pub quorum_timeout: Duration,
    pub suspicion_ticks: u32,
    pub explore_probability: f64,
    pub version: String,
    pub rng_seed: Option<u64>,
}

/// Events funneled into the main loop from exchange tasks and the control
/// surface.
enum Message {
    ExchangeCompleted {
        addr: Url,
        node_id: NodeId,
        version: String,
        cluster_size: u32,
    },
    SetClusterSize(u32),
    QuorumTimeout,
}

struct Engine {
    mailbox: mpsc::Sender<Message>,
    shutdown: watch::Sender<Option<Duration>>,
    main_task: JoinHandle<()>,
    local_addr: Url,
}

/// A gossip node: the replicated store, the loop reconciling it with peers,
/// and the quorum monitor judging whether this node should be serving.
///
/// Built through [GossiperBuilder](crate::builder::GossiperBuilder), which
/// constructs the node without starting it. [start](Gossiper::start) and
/// [stop](Gossiper::stop) may alternate any number of times.
pub struct Gossiper {
    config: GossiperConfig,
    store: SharedStore,
    peer_link: Arc<dyn PeerLink>,
    status: Arc<watch::Sender<SelfStatus>>,
    status_rx: watch::Receiver<SelfStatus>,
    cluster_size: Arc<AtomicU32>,
    running: Option<Engine>,
}

impl Gossiper {
    pub(crate) fn new(config: GossiperConfig, peer_link: Arc<dyn PeerLink>) -> Self {
        let store = Arc::new(RwLock::new(GossipStore::new(
            config.node_id,
            config.version.clone(),
        )));
        let (status_tx, status_rx) = watch::channel(SelfStatus::Down);
        Self {
            config,
            store,
            peer_link,
            status: Arc::new(status_tx),
            status_rx,
            cluster_size: Arc::new(AtomicU32::new(1)),
            running: None,
        }
    }

    /// Binds the listener and spawns the gossip loop. The peer tracker is
    /// rebuilt from `peer_addrs`; addresses learned in a previous run are
    /// forgotten. A node that is already running is left alone.
    pub async fn start(&mut self, peer_addrs: &[Url]) -> Result<(), StartError> {
        if self.running.is_some() {
            return Ok(());
        }

        let listener = self.peer_link.listen(&self.config.self_addr).await?;
        let local_addr = listener.local_addr.clone();

        let (mailbox_tx, mailbox_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        let peers = PeerTracker::new(
            peer_addrs.iter().cloned(),
            self.config.gossip_interval * self.config.suspicion_ticks,
        );
        let quorum = QuorumMonitor::new(self.cluster_size.load(Ordering::SeqCst));
        let cluster = Cluster::new(self.config.node_id, local_addr.clone(), peers, quorum);

        let main = MainLoop {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            peer_link: Arc::clone(&self.peer_link),
            cluster,
            status: Arc::clone(&self.status),
            cluster_size: Arc::clone(&self.cluster_size),
            mailbox_tx: mailbox_tx.clone(),
            rng: match self.config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            quorum_timer: None,
            exchanges: JoinSet::new(),
        };
        let main_task = tokio::spawn(main.run(listener, mailbox_rx, shutdown_rx));

        info!(addr = %local_addr, node = %self.config.node_id, "gossiper started");
        self.running = Some(Engine {
            mailbox: mailbox_tx,
            shutdown: shutdown_tx,
            main_task,
            local_addr,
        });
        Ok(())
    }

    /// Signals the loop to finish, granting in-flight exchanges up to `grace`
    /// to complete, then tears the listener down and reports `Down`. Stopping
    /// a stopped node is a no-op.
    pub async fn stop(&mut self, grace: Duration) {
        let engine = match self.running.take() {
            Some(engine) => engine,
            None => return,
        };
        let _ = engine.shutdown.send(Some(grace));

        let abort = engine.main_task.abort_handle();
        if tokio::time::timeout(grace + STOP_SLACK, engine.main_task)
            .await
            .is_err()
        {
            warn!("gossip loop did not stop within grace, aborting");
            abort.abort();
        }
        self.status.send_replace(SelfStatus::Down);
    }

    /// Replaces the store with a fresh one under the given identity. The peer
    /// set is untouched.
    pub fn init_store(&self, node_id: NodeId, version: impl Into<String>) {
        let mut store = self.store.write().expect("store lock poisoned");
        *store = GossipStore::new(node_id, version);
    }

    pub fn update_self(&self, key: impl Into<StoreKey>, value: impl Into<Vec<u8>>) {
        self.store
            .write()
            .expect("store lock poisoned")
            .update_self(key.into(), value.into());
    }

    /// Sets the cluster size this node judges quorum against and triggers a
    /// re-evaluation.
    pub fn update_cluster_size(&self, size: u32) {
        let size = size.max(1);
        self.cluster_size.store(size, Ordering::SeqCst);
        if let Some(engine) = &self.running {
            if engine
                .mailbox
                .try_send(Message::SetClusterSize(size))
                .is_err()
            {
                warn!("gossip loop mailbox full, cluster size applies next tick");
            }
        }
    }

    pub fn get_self_status(&self) -> SelfStatus {
        *self.status_rx.borrow()
    }

    pub fn get_store_key_value(&self, key: impl Into<StoreKey>) -> Vec<NodeInfo> {
        self.store
            .read()
            .expect("store lock poisoned")
            .get_store_key_value(&key.into())
    }

    pub fn get_store_keys(&self) -> Vec<StoreKey> {
        self.store.read().expect("store lock poisoned").get_store_keys()
    }

    pub fn meta_info(&self) -> MetaInfo {
        self.store.read().expect("store lock poisoned").meta_info()
    }

    pub fn node_id(&self) -> NodeId {
        self.store.read().expect("store lock poisoned").node_id()
    }

    pub fn gossip_interval(&self) -> Duration {
        self.config.gossip_interval
    }

    /// The address the listener actually bound, once started. Differs from
    /// the configured address when binding port 0.
    pub fn local_addr(&self) -> Option<Url> {
        self.running.as_ref().map(|engine| engine.local_addr.clone())
    }
}

struct MainLoop {
    config: GossiperConfig,
    store: SharedStore,
    peer_link: Arc<dyn PeerLink>,
    cluster: Cluster,
    status: Arc<watch::Sender<SelfStatus>>,
    cluster_size: Arc<AtomicU32>,
    mailbox_tx: mpsc::Sender<Message>,
    rng: StdRng,
    quorum_timer: Option<JoinHandle<()>>,
    exchanges: JoinSet<()>,
}

impl MainLoop {
    async fn run(
        mut self,
        mut listener: InboundListener,
        mut mailbox: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<Option<Duration>>,
    ) {
        // The node is coming up, so it counts toward its own quorum even
        // though the monitor still reads `Down` at this point.
        let reachable = self.cluster.peers.reachable_peer_count(Instant::now()) + 1;
        let command = self.cluster.quorum.start(reachable);
        self.apply_timer(command);
        self.publish_status();

        // First round fires immediately so a freshly started node reaches its
        // peers before the first full interval elapses.
        self.tick();

        loop {
            let sleep = jittered(self.config.gossip_interval, &mut self.rng);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    self.tick();
                }
                Some(message) = mailbox.recv() => {
                    self.handle_message(message);
                }
                Some(conn) = listener.connections.recv() => {
                    self.spawn_responder(conn);
                }
                _ = shutdown.changed() => {
                    let grace = { *shutdown.borrow() }.unwrap_or_default();
                    self.drain(grace).await;
                    break;
                }
            }
        }

        listener.shutdown();
        if let Some(timer) = self.quorum_timer.take() {
            timer.abort();
        }
        self.status.send_replace(SelfStatus::Down);
    }

    /// One gossip round: refresh liveness-derived state, then reconcile with
    /// one peer.
    fn tick(&mut self) {
        let now = Instant::now();
        self.refresh_health(now);
        self.gossip_once(now);
        // Reap exchange tasks that have already finished.
        while self.exchanges.try_join_next().is_some() {}
    }

    fn refresh_health(&mut self, now: Instant) {
        let liveness = self.cluster.peers.liveness(now);
        self.store
            .write()
            .expect("store lock poisoned")
            .update_node_statuses(&liveness);
        self.reevaluate_quorum(now);
    }

    fn reevaluate_quorum(&mut self, now: Instant) {
        let reachable = self.cluster.reachable_count(now);
        let command = self.cluster.quorum.reevaluate(reachable);
        self.apply_timer(command);
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let status = self.cluster.quorum.status();
        let previous = self.status.send_replace(status);
        if previous == status {
            return;
        }
        info!(from = %previous, to = %status, "self status changed");
        let entry_status = match status {
            SelfStatus::Up | SelfStatus::UpAndWaitingForQuorum => NodeStatus::Up,
            SelfStatus::WaitingForQuorum => NodeStatus::NotInQuorum,
            SelfStatus::Down => NodeStatus::Down,
        };
        self.store
            .write()
            .expect("store lock poisoned")
            .update_self_status(entry_status);
    }

    fn gossip_once(&mut self, now: Instant) {
        if self.cluster.peers.is_empty() {
            return;
        }
        let reachable = self.cluster.peers.reachable_peers(now);
        let known = self.cluster.peers.known_peers();
        // Unreachable peers are still dialed occasionally: they may have come
        // back, and a fresh node has nothing reachable yet at all.
        let explore =
            reachable.is_empty() || self.rng.gen_bool(self.config.explore_probability);
        let pool = if explore { &known } else { &reachable };
        let target = match pool.choose(&mut self.rng) {
            Some(target) => target.clone(),
            None => return,
        };

        let store = Arc::clone(&self.store);
        let link = Arc::clone(&self.peer_link);
        let mailbox = self.mailbox_tx.clone();
        let advertised = self.cluster.this_advertised_url.clone();
        let cluster_size = self.cluster_size.load(Ordering::SeqCst);
        self.exchanges.spawn(async move {
            match initiate_exchange(link, &target, &store, advertised, cluster_size).await {
                Ok(peer) => {
                    let _ = mailbox
                        .send(Message::ExchangeCompleted {
                            addr: target,
                            node_id: peer.node_id,
                            version: peer.version,
                            cluster_size: peer.cluster_size,
                        })
                        .await;
                }
                Err(error) => {
                    debug!(peer = %target, %error, "outbound exchange failed");
                }
            }
        });
    }

    fn spawn_responder(&mut self, mut conn: Box<dyn PeerConn>) {
        let store = Arc::clone(&self.store);
        let mailbox = self.mailbox_tx.clone();
        let cluster_size = self.cluster_size.load(Ordering::SeqCst);
        self.exchanges.spawn(async move {
            match respond_exchange(conn.as_mut(), &store, cluster_size).await {
                Ok(peer) => {
                    let _ = mailbox
                        .send(Message::ExchangeCompleted {
                            addr: peer.addr,
                            node_id: peer.node_id,
                            version: peer.version,
                            cluster_size: peer.cluster_size,
                        })
                        .await;
                }
                Err(error) => {
                    debug!(%error, "inbound exchange failed");
                }
            }
        });
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::ExchangeCompleted {
                addr,
                node_id,
                version,
                cluster_size,
            } => {
                let now = Instant::now();
                self.cluster
                    .peers
                    .record_exchange(&addr, node_id, &version, now);
                if self.cluster.quorum.observe_remote_cluster_size(cluster_size) {
                    self.cluster_size
                        .store(self.cluster.quorum.cluster_size(), Ordering::SeqCst);
                    info!(size = cluster_size, "adopted larger cluster size from peer");
                }
                self.reevaluate_quorum(now);
            }
            Message::SetClusterSize(size) => {
                self.cluster.quorum.set_cluster_size(size);
                self.reevaluate_quorum(Instant::now());
            }
            Message::QuorumTimeout => {
                self.quorum_timer = None;
                let reachable = self.cluster.reachable_count(Instant::now());
                self.cluster.quorum.on_timer_fired(reachable);
                self.publish_status();
            }
        }
    }

    fn apply_timer(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Keep => {}
            TimerCommand::Arm => {
                if self.quorum_timer.is_none() {
                    let mailbox = self.mailbox_tx.clone();
                    let quorum_timeout = self.config.quorum_timeout;
                    self.quorum_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(quorum_timeout).await;
                        let _ = mailbox.send(Message::QuorumTimeout).await;
                    }));
                }
            }
            TimerCommand::Disarm => {
                if let Some(timer) = self.quorum_timer.take() {
                    timer.abort();
                }
            }
        }
    }

    /// Lets in-flight exchanges finish within `grace`, then aborts the rest.
    /// Aborted merges are safe to discard: update is idempotent.
    async fn drain(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, self.exchanges.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    self.exchanges.abort_all();
                    break;
                }
            }
        }
    }
}

fn jittered(interval: Duration, rng: &mut StdRng) -> Duration {
    interval.mul_f64(rng.gen_range(0.8..=1.2))
}

struct PeerIdentity {
    node_id: NodeId,
    version: String,
    cluster_size: u32,
}

struct InboundIdentity {
    addr: Url,
    node_id: NodeId,
    version: String,
    cluster_size: u32,
}

/// Runs the initiator side of the exchange over a fresh connection.
async fn initiate_exchange(
    link: Arc<dyn PeerLink>,
    target: &Url,
    store: &SharedStore,
    advertised: Url,
    cluster_size: u32,
) -> Result<PeerIdentity, ExchangeError> {
    let mut conn = link.dial(target).await?;

    let (digest, sender_id, version) = {
        let store = store.read().expect("store lock poisoned");
        (
            store.meta_info(),
            store.node_id(),
            store.version().to_string(),
        )
    };
    conn.send(WireMessage::Meta(MetaEnvelope {
        sender_id,
        sender_addr: advertised,
        cluster_size,
        version: version.clone(),
        digest,
    }))
    .await?;

    let response = match conn.recv().await? {
        WireMessage::DiffResponse(payload) => payload,
        _ => return Err(ExchangeError::UnexpectedMessage),
    };
    if response.version != version {
        return Err(ExchangeError::VersionMismatch {
            ours: version,
            theirs: response.version,
        });
    }

    let reply_entries = {
        let mut store = store.write().expect("store lock poisoned");
        store.update(response.entries);
        store.subset(&response.want.unwrap_or_default())
    };
    conn.send(WireMessage::DiffResponse(DiffPayload {
        sender_id,
        cluster_size,
        version,
        entries: reply_entries,
        want: None,
    }))
    .await?;

    match conn.recv().await? {
        WireMessage::Ack => Ok(PeerIdentity {
            node_id: response.sender_id,
            version: response.version,
            cluster_size: response.cluster_size,
        }),
        _ => Err(ExchangeError::UnexpectedMessage),
    }
}

/// Runs the responder side of the exchange on an accepted connection.
async fn respond_exchange(
    conn: &mut dyn PeerConn,
    store: &SharedStore,
    cluster_size: u32,
) -> Result<InboundIdentity, ExchangeError> {
    let meta = match conn.recv().await? {
        WireMessage::Meta(meta) => meta,
        _ => return Err(ExchangeError::UnexpectedMessage),
    };

    let (sender_id, version, entries, want) = {
        let store = store.read().expect("store lock poisoned");
        if meta.version != store.version() {
            return Err(ExchangeError::VersionMismatch {
                ours: store.version().to_string(),
                theirs: meta.version,
            });
        }
        let (need_from_peer, have_newer) = store.diff(&meta.digest);
        (
            store.node_id(),
            store.version().to_string(),
            store.subset(&have_newer),
            need_from_peer,
        )
    };
    conn.send(WireMessage::DiffResponse(DiffPayload {
        sender_id,
        cluster_size,
        version,
        entries,
        want: Some(want),
    }))
    .await?;

    let reply = match conn.recv().await? {
        WireMessage::DiffResponse(payload) => payload,
        _ => return Err(ExchangeError::UnexpectedMessage),
    };
    store
        .write()
        .expect("store lock poisoned")
        .update(reply.entries);

    conn.send(WireMessage::Ack).await?;

    Ok(InboundIdentity {
        addr: meta.sender_addr,
        node_id: meta.sender_id,
        version: meta.version,
        cluster_size: meta.cluster_size,
    })
}
