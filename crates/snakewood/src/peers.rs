//! Peer slots and their connection tasks.
//!
//! Each attached peer owns two outbound queues and two tokio tasks:
//! - **Reader task**: reads length-prefixed frames from the connection,
//!   decodes them, and dispatches to the router state under its mutex.
//! - **Writer task**: drains the protocol queue (FIFO, never dropped) and
//!   then the traffic queue (LIFO, bounded), writes frames with flushing,
//!   and sends keepalives when idle.
//!
//! The local router occupies port 0. It has no queues: a push to it reports
//! failure, which the protocol handlers use to mean "goes nowhere".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::PublicKey;
use crate::router::State;
use crate::types::Port;
use crate::wire::{decode_uvarint, Frame, PacketType};

/// Number of usable switch ports. Port 0 is reserved for the local router.
pub(crate) const PORT_COUNT: usize = 255;

/// Bound on the per-peer LIFO traffic queue.
pub(crate) const TRAFFIC_BUFFER: usize = 255;

// ---------------------------------------------------------------------------
// Outbound queues
// ---------------------------------------------------------------------------

struct QueueInner {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Unbounded FIFO queue for protocol frames. Control traffic is essential
/// for convergence and must never be dropped while the peer is accepting.
pub(crate) struct FifoQueue {
    inner: Mutex<QueueInner>,
}

impl FifoQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn push(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.frames.push_back(frame);
        true
    }

    fn pop(&self) -> Option<Frame> {
        self.inner.lock().unwrap().frames.pop_front()
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.frames.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }
}

/// Bounded LIFO queue for payload traffic. Pops return the newest frame;
/// overflow evicts the oldest buffered frame, trading completeness for
/// freshness.
pub(crate) struct LifoQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl LifoQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                closed: false,
            }),
            capacity,
        }
    }

    fn push(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
        }
        inner.frames.push_back(frame);
        true
    }

    fn pop(&self) -> Option<Frame> {
        self.inner.lock().unwrap().frames.pop_back()
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.frames.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }
}

// ---------------------------------------------------------------------------
// Peer slot
// ---------------------------------------------------------------------------

/// Per-link state for one attached peer.
pub(crate) struct Peer {
    pub port: Port,
    pub public: PublicKey,
    pub zone: String,
    pub peertype: u8,
    pub started: AtomicBool,
    pub cancel: CancellationToken,
    proto: Option<FifoQueue>,
    traffic: Option<LifoQueue>,
    /// Wakes the writer task when either queue gains a frame.
    wakeup: Notify,
}

impl Peer {
    /// Construct a remote peer slot with empty queues, started.
    pub fn new(
        port: Port,
        public: PublicKey,
        zone: String,
        peertype: u8,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            port,
            public,
            zone,
            peertype,
            started: AtomicBool::new(true),
            cancel,
            proto: Some(FifoQueue::new()),
            traffic: Some(LifoQueue::new(TRAFFIC_BUFFER)),
            wakeup: Notify::new(),
        })
    }

    /// Construct the local peer for port 0. It has no queues and no
    /// connection; it stands for "deliver locally" in routing decisions.
    pub fn local(public: PublicKey) -> Arc<Self> {
        Arc::new(Self {
            port: 0,
            public,
            zone: String::new(),
            peertype: 0,
            started: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            proto: None,
            traffic: None,
            wakeup: Notify::new(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.port == 0
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Enqueue a protocol frame. Returns false iff the peer is not
    /// accepting frames (local, stopped, or queue closed).
    pub fn push_proto(&self, frame: Frame) -> bool {
        match &self.proto {
            Some(queue) if queue.push(frame) => {
                self.wakeup.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Enqueue a traffic frame, evicting the oldest buffered frame on
    /// overflow. Returns false iff the peer is not accepting frames.
    pub fn push_traffic(&self, frame: Frame) -> bool {
        match &self.traffic {
            Some(queue) if queue.push(frame) => {
                self.wakeup.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Stop the peer: no further frames are accepted, both queues are
    /// drained, and its tasks are cancelled.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Relaxed);
        if let Some(queue) = &self.proto {
            queue.close();
        }
        if let Some(queue) = &self.traffic {
            queue.close();
        }
        self.wakeup.notify_one();
        self.cancel.cancel();
    }

    /// Pop the next outbound frame for the writer, protocol queue first.
    fn pop_next(&self) -> Option<Frame> {
        if let Some(queue) = &self.proto {
            if let Some(frame) = queue.pop() {
                return Some(frame);
            }
        }
        if let Some(queue) = &self.traffic {
            if let Some(frame) = queue.pop() {
                return Some(frame);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn close_queues(&self) {
        if let Some(queue) = &self.proto {
            queue.close();
        }
        if let Some(queue) = &self.traffic {
            queue.close();
        }
    }

    #[cfg(test)]
    pub fn pop_proto(&self) -> Option<Frame> {
        self.proto.as_ref().and_then(|q| q.pop())
    }

    #[cfg(test)]
    pub fn proto_len(&self) -> usize {
        self.proto.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn pop_traffic(&self) -> Option<Frame> {
        self.traffic.as_ref().and_then(|q| q.pop())
    }

    #[cfg(test)]
    pub fn traffic_len(&self) -> usize {
        self.traffic.as_ref().map(|q| q.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Read a uvarint from an async reader.
async fn read_uvarint<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        reader.read_exact(&mut buf[i..i + 1]).await?;
        if buf[i] & 0x80 == 0 {
            return decode_uvarint(&buf[..i + 1]).map(|(v, _)| v).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed uvarint")
            });
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "uvarint too long",
    ))
}

async fn read_frame_len<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    deadline: Option<Duration>,
) -> std::io::Result<u64> {
    match deadline {
        Some(d) => match tokio::time::timeout(d, read_uvarint(reader)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer read deadline exceeded",
            )),
        },
        None => read_uvarint(reader).await,
    }
}

/// The peer reader task. Reads frames from the connection and dispatches
/// them to the router state. Returns when the connection fails, a deadline
/// passes, or the peer is cancelled; the caller handles detachment.
pub(crate) async fn peer_reader(
    peer: Arc<Peer>,
    conn_read: impl tokio::io::AsyncRead + Unpin + Send,
    state: Arc<tokio::sync::Mutex<State>>,
    config: Config,
) {
    let mut reader = BufReader::new(conn_read);
    let deadline = config.keepalives.then_some(config.peer_timeout);

    loop {
        let len = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            result = read_frame_len(&mut reader, deadline) => match result {
                Ok(len) => len,
                Err(e) => {
                    tracing::debug!(port = peer.port, "peer read failed: {e}");
                    break;
                }
            },
        };

        if len > config.peer_max_message_size {
            tracing::warn!(port = peer.port, len, "oversized frame from peer");
            break;
        }

        let mut buf = vec![0u8; len as usize];
        let read = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            result = reader.read_exact(&mut buf) => result,
        };
        if let Err(e) = read {
            tracing::debug!(port = peer.port, "peer read failed: {e}");
            break;
        }

        match Frame::decode(&buf) {
            Ok(frame) if frame.ptype == PacketType::Keepalive => {}
            Ok(frame) => {
                let mut state = state.lock().await;
                state.forward(&peer, frame);
            }
            Err(e) => {
                // Frame-level errors are recovered locally: log and drop.
                tracing::warn!(port = peer.port, "dropping undecodable frame: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// The peer writer task. Drains the outbound queues (protocol before
/// traffic) and writes frames to the connection, keeping the link alive
/// with keepalive frames while idle.
pub(crate) async fn peer_writer(
    peer: Arc<Peer>,
    mut conn_write: impl tokio::io::AsyncWrite + Unpin + Send,
    config: Config,
) {
    use tokio::io::AsyncWriteExt;

    let keepalive_frame = Frame::new(PacketType::Keepalive).encode_to_vec();
    let mut keepalive_timer = tokio::time::interval(config.peer_keepalive_interval);
    keepalive_timer.tick().await; // skip the immediate first tick

    loop {
        while let Some(frame) = peer.pop_next() {
            if conn_write.write_all(&frame.encode_to_vec()).await.is_err() {
                peer.stop();
                return;
            }
        }
        if conn_write.flush().await.is_err() {
            peer.stop();
            return;
        }

        tokio::select! {
            _ = peer.cancel.cancelled() => break,
            _ = peer.wakeup.notified() => {}
            _ = keepalive_timer.tick(), if config.keepalives => {
                if conn_write.write_all(&keepalive_frame).await.is_err() {
                    break;
                }
                if conn_write.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    peer.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_tag(tag: u8) -> Frame {
        let mut frame = Frame::new(PacketType::Traffic);
        frame.payload = vec![tag];
        frame
    }

    #[test]
    fn proto_queue_is_fifo() {
        let peer = Peer::new(1, [1u8; 32], String::new(), 0, CancellationToken::new());
        for tag in 0..4 {
            assert!(peer.push_proto(frame_with_tag(tag)));
        }
        for tag in 0..4 {
            assert_eq!(peer.pop_proto().unwrap().payload, vec![tag]);
        }
        assert!(peer.pop_proto().is_none());
    }

    #[test]
    fn traffic_queue_is_lifo() {
        let peer = Peer::new(1, [1u8; 32], String::new(), 0, CancellationToken::new());
        for tag in 0..4 {
            assert!(peer.push_traffic(frame_with_tag(tag)));
        }
        // Newest frame comes out first.
        assert_eq!(peer.pop_traffic().unwrap().payload, vec![3]);
        assert_eq!(peer.pop_traffic().unwrap().payload, vec![2]);
    }

    #[test]
    fn traffic_queue_evicts_oldest_at_capacity() {
        let peer = Peer::new(1, [1u8; 32], String::new(), 0, CancellationToken::new());
        for i in 0..TRAFFIC_BUFFER {
            let mut frame = Frame::new(PacketType::Traffic);
            frame.payload = (i as u32).to_be_bytes().to_vec();
            assert!(peer.push_traffic(frame));
        }
        assert_eq!(peer.traffic_len(), TRAFFIC_BUFFER);

        // The 256th pending frame evicts the oldest, not the newest.
        let mut frame = Frame::new(PacketType::Traffic);
        frame.payload = 9999u32.to_be_bytes().to_vec();
        assert!(peer.push_traffic(frame));
        assert_eq!(peer.traffic_len(), TRAFFIC_BUFFER);

        let mut oldest_seen = u32::MAX;
        while let Some(frame) = peer.pop_traffic() {
            let tag = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
            oldest_seen = oldest_seen.min(tag);
        }
        assert_eq!(oldest_seen, 1, "frame 0 should have been evicted");
    }

    #[test]
    fn stopped_peer_refuses_frames() {
        let peer = Peer::new(1, [1u8; 32], String::new(), 0, CancellationToken::new());
        assert!(peer.push_proto(frame_with_tag(0)));
        peer.stop();
        assert!(!peer.started());
        assert!(!peer.push_proto(frame_with_tag(1)));
        assert!(!peer.push_traffic(frame_with_tag(2)));
        // Close also drains anything buffered.
        assert_eq!(peer.proto_len(), 0);
    }

    #[test]
    fn local_peer_has_no_queues() {
        let peer = Peer::local([5u8; 32]);
        assert!(peer.is_local());
        assert!(!peer.push_proto(frame_with_tag(0)));
        assert!(!peer.push_traffic(frame_with_tag(1)));
    }
}
