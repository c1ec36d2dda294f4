//! The router: owns all routing state behind a single mutex and exposes the
//! attach/detach, traffic, and ping APIs.
//!
//! All mutations of the peer array, the tree view and the snake table are
//! serialised through `Arc<Mutex<State>>`; per-peer reader and writer tasks
//! never touch routing state directly. Queue pushes performed by handlers
//! are non-blocking, so the lock is never held across I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use ed25519_dalek::{Signer, SigningKey};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::{Crypto, PublicKey};
use crate::peers::{self, Peer, PORT_COUNT};
use crate::snake::{SnakeEntry, SnakeIndex};
use crate::tree::AnnouncementEntry;
use crate::types::{Addr, AttachError, Conn, PingError, Port};
use crate::wire::{Coordinates, Frame, PacketType, Root};

/// Handshake greeting version byte.
const HANDSHAKE_VERSION: u8 = 1;

/// Handshake capability bits; peers must offer at least these.
const HANDSHAKE_CAPABILITIES: u8 = 0;

/// Greeting: version, capabilities, two reserved bytes, public key, then a
/// signature over everything before it.
const HANDSHAKE_SIZE: usize = 4 + 32 + 64;

/// Capacity of the inbound traffic delivery channel.
const RECV_CHANNEL_SIZE: usize = 512;

/// Rendezvous key for an in-flight ping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PingKey {
    Snek(PublicKey),
    Tree(Coordinates),
}

type PingMap = Arc<StdMutex<HashMap<PingKey, oneshot::Sender<()>>>>;
type ActiveMap = Arc<StdMutex<HashMap<String, Arc<AtomicU64>>>>;

fn active_key(public: &PublicKey, zone: &str) -> String {
    format!("{}{}", hex::encode(public), zone)
}

// ---------------------------------------------------------------------------
// State: everything the single writer owns
// ---------------------------------------------------------------------------

/// All routing state. One logical writer: whoever holds the mutex.
pub(crate) struct State {
    pub crypto: Crypto,
    pub config: Config,
    /// The local peer, also stored at `peers[0]`.
    pub local: Arc<Peer>,
    /// Peer slots indexed by port; `None` slots are free.
    pub peers: Vec<Option<Arc<Peer>>>,

    // Tree state
    pub parent: Option<Port>,
    pub announcements: HashMap<Port, AnnouncementEntry>,
    /// Our own root sequence, used while we are the root.
    pub sequence: u64,
    pub last_announce: Instant,
    pub last_tree_status: Option<(Option<Port>, Root)>,
    /// Set while we are between parents; attach skips the initial
    /// announcement during this window.
    pub waiting: bool,

    // Snake state
    pub table: HashMap<SnakeIndex, SnakeEntry>,
    pub ascending: Option<SnakeIndex>,
    pub descending: Option<SnakeIndex>,

    // Plumbing
    pub recv_tx: mpsc::Sender<(Addr, Vec<u8>)>,
    pub pings: PingMap,
}

impl State {
    pub fn new(
        crypto: Crypto,
        config: Config,
        recv_tx: mpsc::Sender<(Addr, Vec<u8>)>,
        pings: PingMap,
    ) -> Self {
        let local = Peer::local(crypto.public_key);
        let mut peers: Vec<Option<Arc<Peer>>> = vec![None; PORT_COUNT + 1];
        peers[0] = Some(local.clone());
        Self {
            crypto,
            config,
            local,
            peers,
            parent: None,
            announcements: HashMap::new(),
            sequence: 0,
            last_announce: Instant::now(),
            last_tree_status: None,
            waiting: false,
            table: HashMap::new(),
            ascending: None,
            descending: None,
            recv_tx,
            pings,
        }
    }

    pub fn peer(&self, port: Port) -> Option<Arc<Peer>> {
        self.peers.get(port as usize).and_then(|slot| slot.clone())
    }

    /// Lowest free port in 1..=255, or None when the switch is full.
    pub fn allocate_port(&self) -> Option<Port> {
        (1..=PORT_COUNT)
            .find(|&i| self.peers[i].is_none())
            .map(|i| i as Port)
    }

    pub fn add_peer(&mut self, peer: Arc<Peer>) {
        let port = peer.port as usize;
        self.peers[port] = Some(peer);
    }

    /// Drop a peer slot: stop it, forget its announcement (re-electing the
    /// parent if needed) and tear down every snake path through it. Returns
    /// false if the slot no longer holds this peer.
    pub fn remove_peer(&mut self, peer: &Arc<Peer>) -> bool {
        let held = self
            .peers
            .get(peer.port as usize)
            .and_then(|slot| slot.as_ref())
            .map(|p| Arc::ptr_eq(p, peer))
            .unwrap_or(false);
        if !held {
            return false;
        }
        self.peers[peer.port as usize] = None;
        peer.stop();

        self.remove_tree_peer(peer.port);

        let affected: Vec<SnakeIndex> = self
            .table
            .iter()
            .filter(|(_, entry)| {
                Arc::ptr_eq(&entry.source, peer) || Arc::ptr_eq(&entry.destination, peer)
            })
            .map(|(&idx, _)| idx)
            .collect();
        for idx in affected {
            self.send_teardown_for_existing_path(peer, idx.public_key, idx.path_id);
        }
        true
    }

    /// One maintenance tick: tree first (the snake reads the epoch), then
    /// the snake.
    pub fn maintain(&mut self) {
        self.maintain_tree();
        self.maintain_snake();
    }

    fn complete_ping(&self, key: PingKey) {
        if let Some(tx) = self.pings.lock().unwrap().remove(&key) {
            let _ = tx.send(());
        }
    }

    /// Frame ingress and egress dispatch. `from` is the peer the frame
    /// arrived through, or the local peer for locally originated frames.
    pub fn forward(&mut self, from: &Arc<Peer>, frame: Frame) {
        match frame.ptype {
            PacketType::Keepalive => {}
            PacketType::TreeAnnouncement => {
                if let Err(e) = self.handle_tree_announcement(from, &frame) {
                    tracing::warn!(port = from.port, "dropping announcement: {e}");
                }
            }
            PacketType::TreePing => {
                let nexthop = self.next_hop_tree(&frame);
                if nexthop.is_local() {
                    let mut pong = Frame::new(PacketType::TreePong);
                    pong.source = self.coords();
                    pong.destination = frame.source;
                    let hop = self.next_hop_tree(&pong);
                    if !hop.is_local() {
                        hop.push_proto(pong);
                    }
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::TreePong => {
                let nexthop = self.next_hop_tree(&frame);
                if nexthop.is_local() {
                    self.complete_ping(PingKey::Tree(frame.source));
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::SnekPing => {
                let nexthop = self.next_hop_snek(&frame, false);
                if nexthop.is_local() {
                    if frame.destination_key == self.crypto.public_key {
                        let mut pong = Frame::new(PacketType::SnekPong);
                        pong.source_key = self.crypto.public_key;
                        pong.destination_key = frame.source_key;
                        let hop = self.next_hop_snek(&pong, false);
                        if !hop.is_local() {
                            hop.push_proto(pong);
                        }
                    }
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::SnekPong => {
                let nexthop = self.next_hop_snek(&frame, false);
                if nexthop.is_local() {
                    if frame.destination_key == self.crypto.public_key {
                        self.complete_ping(PingKey::Snek(frame.source_key));
                    }
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::Bootstrap => {
                // Bootstraps are handled wherever the climb through keyspace
                // ends.
                let nexthop = self.next_hop_snek(&frame, true);
                if nexthop.is_local() {
                    if let Err(e) = self.handle_bootstrap(from, &frame) {
                        tracing::warn!(port = from.port, "dropping bootstrap: {e}");
                    }
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::BootstrapAck => {
                let nexthop = self.next_hop_tree(&frame);
                if nexthop.is_local() {
                    if let Err(e) = self.handle_bootstrap_ack(from, &frame) {
                        tracing::warn!(port = from.port, "dropping bootstrap ack: {e}");
                    }
                } else {
                    nexthop.push_proto(frame);
                }
            }
            PacketType::Setup => {
                // Setups are processed by every node on the path.
                let nexthop = self.next_hop_tree(&frame);
                if let Err(e) = self.handle_setup(from, &frame, nexthop) {
                    tracing::warn!(port = from.port, "dropping setup: {e}");
                }
            }
            PacketType::Teardown => {
                if let Err(e) = self.handle_teardown(from, &frame) {
                    tracing::warn!(port = from.port, "dropping teardown: {e}");
                }
            }
            PacketType::Traffic => {
                let nexthop = self.next_hop_snek(&frame, false);
                if nexthop.is_local() {
                    if frame.destination_key == self.crypto.public_key {
                        // Best effort: a full delivery channel drops the frame.
                        let _ = self
                            .recv_tx
                            .try_send((Addr(frame.source_key), frame.payload));
                    } else {
                        tracing::debug!("dropping traffic with no closer hop");
                    }
                } else {
                    nexthop.push_traffic(frame);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router: the public handle
// ---------------------------------------------------------------------------

/// Diagnostic snapshot of routing state.
#[derive(Clone, Debug)]
pub struct DebugSnapshot {
    /// Current tree root key.
    pub root: Addr,
    /// Our tree coordinates.
    pub coords: Coordinates,
    /// Key of our tree parent, if any.
    pub parent: Option<Addr>,
    /// Number of snake table entries.
    pub table_len: usize,
    /// Key of our ascending snake neighbour, if any.
    pub ascending: Option<Addr>,
    /// Key of our descending snake neighbour, if any.
    pub descending: Option<Addr>,
}

pub struct Router {
    config: Config,
    public: PublicKey,
    signing_key: SigningKey,
    state: Arc<Mutex<State>>,
    active: ActiveMap,
    pings: PingMap,
    recv_rx: Mutex<mpsc::Receiver<(Addr, Vec<u8>)>>,
    cancel: CancellationToken,
}

impl Router {
    /// Create a router and start its maintenance loop. Must be called from
    /// within a tokio runtime.
    pub fn new(signing_key: SigningKey, config: Config) -> Arc<Self> {
        let crypto = Crypto::new(signing_key.clone());
        let public = crypto.public_key;
        let (recv_tx, recv_rx) = mpsc::channel(RECV_CHANNEL_SIZE);
        let pings: PingMap = Arc::new(StdMutex::new(HashMap::new()));
        let state = Arc::new(Mutex::new(State::new(
            crypto,
            config.clone(),
            recv_tx,
            pings.clone(),
        )));
        let cancel = CancellationToken::new();

        {
            let state = state.clone();
            let cancel = cancel.clone();
            let tick = config.snake_maintain_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    let mut state = state.lock().await;
                    state.maintain();
                }
            });
        }

        tracing::debug!(identity = %Addr(public), "router started");
        Arc::new(Self {
            config,
            public,
            signing_key,
            state,
            active: Arc::new(StdMutex::new(HashMap::new())),
            pings,
            recv_rx: Mutex::new(recv_rx),
            cancel,
        })
    }

    pub fn public_key(&self) -> Addr {
        Addr(self.public)
    }

    pub fn private_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn addr(&self) -> Addr {
        Addr(self.public)
    }

    /// Cancel the router and everything attached to it.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// True if at least one live peering exists for the key in the zone.
    pub fn is_connected(&self, key: Addr, zone: &str) -> bool {
        self.active
            .lock()
            .unwrap()
            .get(&active_key(&key.0, zone))
            .map(|count| count.load(Ordering::Relaxed) > 0)
            .unwrap_or(false)
    }

    /// Attach an already authenticated connection: allocate the lowest free
    /// port, bring the peer into the tree, and start its I/O tasks.
    pub async fn attach(
        &self,
        conn: Box<dyn Conn>,
        public: Addr,
        zone: &str,
        peertype: u8,
    ) -> Result<Port, AttachError> {
        let peer = {
            let mut state = self.state.lock().await;
            let Some(port) = state.allocate_port() else {
                return Err(AttachError::NoFreePorts);
            };
            let peer = Peer::new(
                port,
                public.0,
                zone.to_string(),
                peertype,
                self.cancel.child_token(),
            );
            state.add_peer(peer.clone());
            // Bring the new peer up to date with our tree view, unless we
            // are between parents.
            if !state.waiting {
                state.announce_to_peer(&peer);
            }
            peer
        };

        let counter = {
            let mut active = self.active.lock().unwrap();
            active
                .entry(active_key(&public.0, zone))
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        counter.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            port = peer.port,
            peer = %public,
            zone = %peer.zone,
            peertype = peer.peertype,
            "peer attached"
        );

        let (read_half, write_half) = tokio::io::split(conn);
        tokio::spawn(peers::peer_writer(
            peer.clone(),
            write_half,
            self.config.clone(),
        ));

        let state = self.state.clone();
        let active = self.active.clone();
        let config = self.config.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            peers::peer_reader(reader_peer.clone(), read_half, state.clone(), config).await;
            detach_peer(&state, &active, &reader_peer).await;
        });

        Ok(peer.port)
    }

    /// Exchange the signed greeting with the remote side, then attach.
    /// `{version, capabilities, 0, 0} || public key || signature`, where the
    /// signature covers the 36 bytes before it. Reads and writes run under
    /// the keepalive deadline.
    pub async fn attach_authenticated(
        &self,
        mut conn: Box<dyn Conn>,
        zone: &str,
        peertype: u8,
    ) -> Result<Port, AttachError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut handshake = Vec::with_capacity(HANDSHAKE_SIZE);
        handshake.extend_from_slice(&[HANDSHAKE_VERSION, HANDSHAKE_CAPABILITIES, 0, 0]);
        handshake.extend_from_slice(&self.public);
        let sig = self.signing_key.sign(&handshake);
        handshake.extend_from_slice(&sig.to_bytes());

        let deadline = self.config.peer_keepalive_interval;
        with_deadline(deadline, conn.write_all(&handshake)).await?;

        let mut theirs = [0u8; HANDSHAKE_SIZE];
        with_deadline(deadline, conn.read_exact(&mut theirs)).await?;

        if theirs[0] != HANDSHAKE_VERSION {
            return Err(AttachError::HandshakeVersionMismatch);
        }
        if theirs[1] & HANDSHAKE_CAPABILITIES != HANDSHAKE_CAPABILITIES {
            return Err(AttachError::HandshakeCapMismatch);
        }
        let mut public = [0u8; 32];
        public.copy_from_slice(&theirs[4..36]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&theirs[36..]);
        if !Crypto::verify(&public, &theirs[..36], &signature) {
            return Err(AttachError::HandshakeSignatureInvalid);
        }

        self.attach(conn, Addr(public), zone, peertype).await
    }

    /// Stop the peer on the given port. Its reader observes the
    /// cancellation and performs the detach bookkeeping.
    pub async fn detach(&self, port: Port) {
        let peer = {
            let state = self.state.lock().await;
            state.peer(port)
        };
        if let Some(peer) = peer {
            if !peer.is_local() {
                peer.stop();
            }
        }
    }

    /// Send best-effort traffic to a key.
    pub async fn send(&self, to: Addr, payload: &[u8]) {
        if payload.len() as u64 > self.config.peer_max_message_size {
            tracing::warn!(len = payload.len(), "dropping oversized payload");
            return;
        }
        let mut frame = Frame::new(PacketType::Traffic);
        frame.source_key = self.public;
        frame.destination_key = to.0;
        frame.payload = payload.to_vec();
        let mut state = self.state.lock().await;
        let local = state.local.clone();
        state.forward(&local, frame);
    }

    /// Receive the next traffic payload addressed to us. Returns None once
    /// the router is closed.
    pub async fn recv(&self) -> Option<(Addr, Vec<u8>)> {
        let mut rx = self.recv_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    fn register_ping(&self, key: PingKey) -> Result<oneshot::Receiver<()>, PingError> {
        let mut pings = self.pings.lock().unwrap();
        if pings.contains_key(&key) {
            return Err(PingError::AlreadyInProgress);
        }
        let (tx, rx) = oneshot::channel();
        pings.insert(key, tx);
        Ok(rx)
    }

    /// Key-addressed ping: round trip to the node owning `dst`, or timeout.
    /// Only one ping per destination may be in flight at a time.
    pub async fn snek_ping(&self, dst: Addr, timeout: Duration) -> Result<Duration, PingError> {
        if dst.0 == self.public {
            return Ok(Duration::ZERO);
        }
        let rx = self.register_ping(PingKey::Snek(dst.0))?;
        {
            let mut state = self.state.lock().await;
            let mut frame = Frame::new(PacketType::SnekPing);
            frame.source_key = self.public;
            frame.destination_key = dst.0;
            let local = state.local.clone();
            state.forward(&local, frame);
        }
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, rx).await;
        self.pings.lock().unwrap().remove(&PingKey::Snek(dst.0));
        match result {
            Ok(Ok(())) => Ok(start.elapsed()),
            _ => Err(PingError::Timeout),
        }
    }

    /// Coordinate-addressed ping along the tree.
    pub async fn tree_ping(
        &self,
        dst: Coordinates,
        timeout: Duration,
    ) -> Result<Duration, PingError> {
        let ours = {
            let state = self.state.lock().await;
            state.coords()
        };
        if dst == ours {
            return Ok(Duration::ZERO);
        }
        let rx = self.register_ping(PingKey::Tree(dst.clone()))?;
        {
            let mut state = self.state.lock().await;
            let mut frame = Frame::new(PacketType::TreePing);
            frame.source = state.coords();
            frame.destination = dst.clone();
            let local = state.local.clone();
            state.forward(&local, frame);
        }
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, rx).await;
        self.pings.lock().unwrap().remove(&PingKey::Tree(dst));
        match result {
            Ok(Ok(())) => Ok(start.elapsed()),
            _ => Err(PingError::Timeout),
        }
    }

    pub async fn debug_snapshot(&self) -> DebugSnapshot {
        let state = self.state.lock().await;
        DebugSnapshot {
            root: Addr(state.root().public_key),
            coords: state.coords(),
            parent: state.parent_peer().map(|p| Addr(p.public)),
            table_len: state.table.len(),
            ascending: state
                .ascending
                .and_then(|idx| state.table.get(&idx))
                .map(|entry| Addr(entry.origin)),
            descending: state.descending.map(|idx| Addr(idx.public_key)),
        }
    }
}

/// Detach bookkeeping shared by explicit detach and read failure.
async fn detach_peer(state: &Arc<Mutex<State>>, active: &ActiveMap, peer: &Arc<Peer>) {
    let removed = {
        let mut state = state.lock().await;
        state.remove_peer(peer)
    };
    if !removed {
        return;
    }
    let counter = active
        .lock()
        .unwrap()
        .get(&active_key(&peer.public, &peer.zone))
        .cloned();
    if let Some(counter) = counter {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
    tracing::debug!(port = peer.port, peer = %Addr(peer.public), "peer detached");
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, AttachError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AttachError::ConnectionIO(e)),
        Err(_) => Err(AttachError::ConnectionIO(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake deadline exceeded",
        ))),
    }
}

// ---------------------------------------------------------------------------
// Test helpers and tests
// ---------------------------------------------------------------------------

#[cfg(test)]
impl State {
    pub(crate) fn add_test_peer(&mut self, port: Port, public: PublicKey) -> Arc<Peer> {
        let peer = Peer::new(port, public, String::new(), 0, CancellationToken::new());
        self.peers[port as usize] = Some(peer.clone());
        peer
    }

    pub(crate) fn store_test_announcement(
        &mut self,
        port: Port,
        ann: crate::tree::RootAnnouncement,
    ) {
        self.announcements.insert(
            port,
            AnnouncementEntry {
                ann,
                received: Instant::now(),
            },
        );
    }
}
