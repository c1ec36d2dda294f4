//! Virtual snake DHT: a doubly-linked ordering of the whole network through
//! keyspace.
//!
//! Every node tries to hold a path to its *ascending* neighbour (the next
//! higher key it can find) and accepts a path from its *descending*
//! neighbour (the next lower key). Paths are negotiated with a bootstrap /
//! bootstrap-ACK / setup exchange and removed with teardowns; intermediate
//! nodes on a path keep table entries that the SNEK next-hop selector uses
//! to refine key-addressed routing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crypto::{dht_ordered, key_less, PublicKey};
use crate::peers::Peer;
use crate::router::State;
use crate::tree::hex_prefix;
use crate::types::FrameError;
use crate::wire::{
    Frame, PacketType, PathId, Root, SnakePathUpdate, SnakeTeardown, PATH_ID_SIZE,
};

/// Index of a snake path: the lower of the two endpoint keys plus the random
/// path identifier its originator chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SnakeIndex {
    pub public_key: PublicKey,
    pub path_id: PathId,
}

/// One hop of a snake path as seen from this node. `source` is the peer
/// through which lower-keyed traffic enters, `destination` the peer through
/// which higher-keyed traffic exits; either can be the local peer when this
/// node is an endpoint.
pub(crate) struct SnakeEntry {
    pub index: SnakeIndex,
    pub origin: PublicKey,
    pub source: Arc<Peer>,
    pub destination: Arc<Peer>,
    pub last_seen: Instant,
    pub root: Root,
}

impl SnakeEntry {
    /// Entries must age out eventually in case a teardown never arrives.
    pub fn valid(&self, expiry: Duration) -> bool {
        self.last_seen.elapsed() < expiry
    }
}

/// Build a teardown frame for the given path.
fn teardown_frame(path_key: PublicKey, path_id: PathId) -> Frame {
    let mut frame = Frame::new(PacketType::Teardown);
    frame.destination_key = path_key;
    frame.payload = SnakeTeardown { path_id }.encode_to_vec();
    frame
}

/// Replace the best candidate if `candidate` is an exact match for the
/// destination or lies strictly between the destination and the current
/// best in cyclic keyspace order.
fn choose_candidate(
    bootstrap: bool,
    dest_key: &PublicKey,
    best_key: &mut PublicKey,
    best_peer: &mut Arc<Peer>,
    candidate: PublicKey,
    peer: &Arc<Peer>,
) {
    let exact = !bootstrap && candidate == *dest_key && *best_key != *dest_key;
    if exact || dht_ordered(dest_key, &candidate, best_key) {
        *best_key = candidate;
        *best_peer = peer.clone();
    }
}

impl State {
    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Snake upkeep, once per maintain interval: tear down expired paths and
    /// decide whether a new bootstrap needs to go out.
    pub(crate) fn maintain_snake(&mut self) {
        // The root node never bootstraps: there is no higher key for the
        // bootstrap to reach.
        let root = self.root();
        let can_bootstrap =
            self.parent.is_some() && root.public_key != self.crypto.public_key;
        let mut will_bootstrap = false;
        let expiry = self.config.snake_expiry_period;
        let local = self.local.clone();

        if let Some(idx) = self.ascending {
            let status = self
                .table
                .get(&idx)
                .map(|entry| (!entry.valid(expiry), entry.root != root));
            if let Some((expired, stale)) = status {
                if expired {
                    // Expiry both removes the path and retriggers the
                    // bootstrap, even when the epoch still matches.
                    self.send_teardown_for_existing_path(&local, idx.public_key, idx.path_id);
                    will_bootstrap = can_bootstrap;
                } else if stale {
                    // The path was set up under an older tree epoch; a new
                    // bootstrap should replace it.
                    will_bootstrap = can_bootstrap;
                }
            }
        } else {
            will_bootstrap = can_bootstrap;
        }

        if let Some(idx) = self.descending {
            let expired = self
                .table
                .get(&idx)
                .map(|entry| !entry.valid(expiry))
                .unwrap_or(false);
            if expired {
                // Tearing it down prompts the remote side to bootstrap again
                // if it is still alive.
                self.send_teardown_for_existing_path(&local, idx.public_key, idx.path_id);
            }
        }

        // Sweep any remaining expired entries where we are intermediate.
        let expired: Vec<SnakeIndex> = self
            .table
            .iter()
            .filter(|(_, entry)| !entry.valid(expiry))
            .map(|(&idx, _)| idx)
            .collect();
        for idx in expired {
            if self.table.contains_key(&idx) {
                self.send_teardown_for_existing_path(&local, idx.public_key, idx.path_id);
            }
        }

        if will_bootstrap {
            self.bootstrap_now();
        }
    }

    /// Send a bootstrap into the network, looking for our ascending node.
    pub(crate) fn bootstrap_now(&mut self) {
        // As the root we hold the highest key: a bootstrap could not ascend
        // anywhere.
        if self.parent.is_none() {
            return;
        }
        let root = self.root();
        // An ascending path set up under the current epoch is still good.
        if let Some(idx) = self.ascending {
            if let Some(entry) = self.table.get(&idx) {
                if entry.source.started() && entry.root == root {
                    return;
                }
            }
        }
        let mut path_id: PathId = [0u8; PATH_ID_SIZE];
        {
            use rand::Rng;
            rand::thread_rng().fill(&mut path_id[..]);
        }
        let update = SnakePathUpdate { path_id, root };
        // The destination key is our own: SNEK bootstrap routing rewards
        // higher keys, so the frame climbs toward our next ascending key.
        let mut frame = Frame::new(PacketType::Bootstrap);
        frame.destination_key = self.crypto.public_key;
        frame.source = self.coords();
        frame.payload = update.encode_to_vec();
        let nexthop = self.next_hop_snek(&frame, true);
        if !nexthop.is_local() {
            tracing::debug!(port = nexthop.port, "sending bootstrap");
            nexthop.push_proto(frame);
        }
    }

    // -----------------------------------------------------------------------
    // Next-hop selection
    // -----------------------------------------------------------------------

    /// Pick the best outbound peer for a SNEK-routed frame. Never fails:
    /// when no candidate improves on our own key the local peer is returned.
    pub(crate) fn next_hop_snek(&self, frame: &Frame, bootstrap: bool) -> Arc<Peer> {
        let dest_key = frame.destination_key;
        // Loopback: non-bootstrap frames for our own key are handled here.
        if !bootstrap && self.crypto.public_key == dest_key {
            return self.local.clone();
        }
        let root = self.root();
        let expiry = self.config.snake_expiry_period;
        let mut best_key = self.crypto.public_key;
        let mut best_peer = self.local.clone();

        if let Some(parent_port) = self.parent {
            if let Some(parent) = self.peer(parent_port).filter(|p| p.started()) {
                // Bootstraps always start climbing toward the root so they
                // reach somewhere rather than getting stuck; other frames
                // climb only when the destination is above us in keyspace.
                if (bootstrap && best_key == dest_key)
                    || dht_ordered(&best_key, &dest_key, &root.public_key)
                {
                    best_key = root.public_key;
                    best_peer = parent.clone();
                }
                // Our direct ancestors, root through parent.
                if let Some(entry) = self.announcements.get(&parent_port) {
                    for sig in &entry.ann.signatures {
                        choose_candidate(
                            bootstrap,
                            &dest_key,
                            &mut best_key,
                            &mut best_peer,
                            sig.public_key,
                            &parent,
                        );
                    }
                }
            }
        }

        // The ancestors of every started peer.
        for (&port, entry) in &self.announcements {
            let Some(peer) = self.peer(port).filter(|p| p.started()) else {
                continue;
            };
            for sig in &entry.ann.signatures {
                choose_candidate(
                    bootstrap,
                    &dest_key,
                    &mut best_key,
                    &mut best_peer,
                    sig.public_key,
                    &peer,
                );
            }
        }

        // If the best key is a node we peer with directly, the peering beats
        // a multi-hop path through the tree.
        for (&port, _) in &self.announcements {
            let Some(peer) = self.peer(port).filter(|p| p.started()) else {
                continue;
            };
            if best_key == peer.public {
                best_peer = peer;
            }
        }

        // Snake table refinement. Only the source side of each path is
        // interesting: setups travel from lower key to higher, so following
        // sources descends through keyspace toward the destination.
        for entry in self.table.values() {
            if !entry.source.started() || !entry.valid(expiry) || entry.source.is_local() {
                continue;
            }
            choose_candidate(
                bootstrap,
                &dest_key,
                &mut best_key,
                &mut best_peer,
                entry.index.public_key,
                &entry.source,
            );
        }

        best_peer
    }

    // -----------------------------------------------------------------------
    // Protocol handlers
    // -----------------------------------------------------------------------

    /// A bootstrap ended its climb here: answer with a bootstrap ACK, tree
    /// routed back to the originator's coordinates. No table change.
    pub(crate) fn handle_bootstrap(&self, _from: &Arc<Peer>, rx: &Frame) -> Result<(), FrameError> {
        let bootstrap = SnakePathUpdate::decode(&rx.payload)?;
        let root = self.root();
        let ack = SnakePathUpdate {
            path_id: bootstrap.path_id,
            root,
        };
        let mut frame = Frame::new(PacketType::BootstrapAck);
        frame.destination = rx.source.clone();
        frame.destination_key = rx.destination_key;
        frame.source = self.coords();
        frame.source_key = self.crypto.public_key;
        frame.payload = ack.encode_to_vec();
        let nexthop = self.next_hop_tree(&frame);
        if !nexthop.is_local() {
            nexthop.push_proto(frame);
        }
        Ok(())
    }

    /// Decide whether the ACK sender should become our ascending neighbour
    /// and, if so, send a setup along the tree and install the path.
    pub(crate) fn handle_bootstrap_ack(
        &mut self,
        _from: &Arc<Peer>,
        rx: &Frame,
    ) -> Result<(), FrameError> {
        let ack = SnakePathUpdate::decode(&rx.payload)?;
        let root = self.root();
        let expiry = self.config.snake_expiry_period;
        let asc = self
            .ascending
            .and_then(|idx| self.table.get(&idx))
            .map(|entry| (entry.index, entry.origin, entry.valid(expiry)));

        let update = if rx.source_key == self.crypto.public_key {
            // Looped back to ourselves, either by forwarding error or a
            // routing loop. Don't act on it.
            false
        } else if ack.root != root {
            // Different tree epoch: setups would not tree-route reliably.
            false
        } else {
            match asc {
                Some((index, origin, valid)) if valid => {
                    if index.public_key == rx.source_key && ack.path_id != index.path_id {
                        // A fresh ACK from the ascending node itself.
                        true
                    } else {
                        // A node strictly between us and the current
                        // ascending origin is a closer neighbour.
                        dht_ordered(&self.crypto.public_key, &rx.source_key, &origin)
                    }
                }
                _ => key_less(&self.crypto.public_key, &rx.source_key),
            }
        };
        if !update {
            return Ok(());
        }

        let setup = SnakePathUpdate {
            path_id: ack.path_id,
            root,
        };
        let mut frame = Frame::new(PacketType::Setup);
        frame.destination = rx.source.clone();
        frame.destination_key = rx.source_key;
        frame.source_key = self.crypto.public_key;
        frame.payload = setup.encode_to_vec();
        let nexthop = self.next_hop_tree(&frame);
        // Install nothing unless the setup actually left the node, otherwise
        // we hold a path entry for a path that doesn't exist.
        if nexthop.is_local() || !nexthop.started() || !nexthop.push_proto(frame) {
            return Ok(());
        }

        // The remote side cleans up the path we replaced, but any other
        // outbound paths of ours are orphans now and would invite loops.
        let local = self.local.clone();
        let stale: Vec<SnakeIndex> = self
            .table
            .iter()
            .filter(|(_, entry)| {
                entry.source.is_local() && entry.index.public_key != rx.source_key
            })
            .map(|(&idx, _)| idx)
            .collect();
        for idx in stale {
            self.send_teardown_for_existing_path(&local, idx.public_key, idx.path_id);
        }

        let index = SnakeIndex {
            public_key: self.crypto.public_key,
            path_id: ack.path_id,
        };
        tracing::debug!(
            ascending = %hex_prefix(&rx.source_key),
            "installing ascending path"
        );
        self.table.insert(
            index,
            SnakeEntry {
                index,
                origin: rx.source_key,
                source: local,
                destination: nexthop,
                last_seen: Instant::now(),
                root: ack.root,
            },
        );
        self.ascending = Some(index);
        Ok(())
    }

    /// Process a setup. Every node on the path handles setups, endpoints and
    /// intermediates alike; `nexthop` is the tree-routing decision made by
    /// the dispatcher.
    pub(crate) fn handle_setup(
        &mut self,
        from: &Arc<Peer>,
        rx: &Frame,
        nexthop: Arc<Peer>,
    ) -> Result<(), FrameError> {
        let setup = SnakePathUpdate::decode(&rx.payload)?;
        let root = self.root();
        if setup.root != root {
            self.send_teardown_for_rejected_path(rx.source_key, setup.path_id, from);
            return Ok(());
        }
        let index = SnakeIndex {
            public_key: rx.source_key,
            path_id: setup.path_id,
        };
        if self.table.contains_key(&index) {
            // A duplicate path shouldn't happen. Fix our own table first,
            // then bounce a rejection to the sender; the origin will retry
            // with a fresh path ID.
            let local = self.local.clone();
            self.send_teardown_for_existing_path(&local, rx.source_key, setup.path_id);
            self.send_teardown_for_rejected_path(rx.source_key, setup.path_id, from);
            return Ok(());
        }

        if rx.destination_key == self.crypto.public_key {
            // We are the destination: the originator wants to be our
            // descending neighbour.
            let expiry = self.config.snake_expiry_period;
            let desc = self
                .descending
                .and_then(|idx| self.table.get(&idx))
                .map(|entry| (entry.index, entry.valid(expiry)));
            let update = if !key_less(&rx.source_key, &self.crypto.public_key) {
                // A descending neighbour must sit below us in keyspace.
                false
            } else {
                match desc {
                    Some((didx, valid)) if valid => {
                        if didx.public_key == rx.source_key && setup.path_id != didx.path_id {
                            // Refresh from the current descending node.
                            true
                        } else {
                            // Strictly between the old descending key and us:
                            // a closer neighbour.
                            dht_ordered(&didx.public_key, &rx.source_key, &self.crypto.public_key)
                        }
                    }
                    _ => true,
                }
            };
            if !update {
                self.send_teardown_for_rejected_path(rx.source_key, setup.path_id, from);
                return Ok(());
            }
            if let Some(didx) = self.descending {
                let local = self.local.clone();
                self.send_teardown_for_existing_path(&local, didx.public_key, didx.path_id);
            }
            tracing::debug!(
                descending = %hex_prefix(&rx.source_key),
                "installing descending path"
            );
            self.table.insert(
                index,
                SnakeEntry {
                    index,
                    origin: rx.source_key,
                    source: from.clone(),
                    destination: self.local.clone(),
                    last_seen: Instant::now(),
                    root: setup.root,
                },
            );
            self.descending = Some(index);
            return Ok(());
        }

        // Intermediate node: forward first. If the setup can't continue
        // there is no point in keeping the path.
        if nexthop.is_local() || !nexthop.started() || !nexthop.push_proto(rx.clone()) {
            self.send_teardown_for_rejected_path(rx.source_key, setup.path_id, from);
            return Ok(());
        }
        self.table.insert(
            index,
            SnakeEntry {
                index,
                origin: rx.source_key,
                source: from.clone(),       // lower key side
                destination: nexthop,       // higher key side
                last_seen: Instant::now(),
                root: setup.root,
            },
        );
        Ok(())
    }

    /// Process a teardown and forward it to whichever peers still hold the
    /// other ends of the path.
    pub(crate) fn handle_teardown(
        &mut self,
        from: &Arc<Peer>,
        rx: &Frame,
    ) -> Result<(), FrameError> {
        if rx.payload.len() < PATH_ID_SIZE {
            return Err(FrameError::PayloadTooShort);
        }
        let teardown = SnakeTeardown::decode(&rx.payload)?;
        let frame = teardown_frame(rx.destination_key, teardown.path_id);
        let (next, rebootstrap) = self.teardown_path(from, rx.destination_key, teardown.path_id);
        for peer in next {
            if !peer.is_local() {
                peer.push_proto(frame.clone());
            }
        }
        if rebootstrap {
            self.bootstrap_now();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teardown emission
    // -----------------------------------------------------------------------

    /// Notify the sender of a path we refused. The path was never installed
    /// downstream of us, so nobody else needs to hear about it.
    pub(crate) fn send_teardown_for_rejected_path(
        &self,
        path_key: PublicKey,
        path_id: PathId,
        via: &Arc<Peer>,
    ) {
        via.push_proto(teardown_frame(path_key, path_id));
    }

    /// Remove a path that made it into the routing table and notify the
    /// surviving directions.
    pub(crate) fn send_teardown_for_existing_path(
        &mut self,
        from: &Arc<Peer>,
        path_key: PublicKey,
        path_id: PathId,
    ) {
        let frame = teardown_frame(path_key, path_id);
        let (next, rebootstrap) = self.teardown_path(from, path_key, path_id);
        for peer in next {
            if !peer.is_local() {
                peer.push_proto(frame.clone());
            }
        }
        if rebootstrap {
            self.bootstrap_now();
        }
    }

    /// Drop whatever we hold for the path and report which peers the
    /// teardown must continue to, plus whether losing our ascending path
    /// means an immediate bootstrap is due.
    fn teardown_path(
        &mut self,
        from: &Arc<Peer>,
        path_key: PublicKey,
        path_id: PathId,
    ) -> (Vec<Arc<Peer>>, bool) {
        if let Some(idx) = self
            .ascending
            .filter(|i| i.public_key == path_key && i.path_id == path_id)
        {
            let matches = self
                .table
                .get(&idx)
                .map(|entry| from.is_local() || Arc::ptr_eq(from, &entry.destination))
                .unwrap_or(false);
            if matches {
                self.ascending = None;
                if let Some(entry) = self.table.remove(&idx) {
                    return (vec![entry.destination], true);
                }
            }
        }
        if let Some(idx) = self
            .descending
            .filter(|i| i.public_key == path_key && i.path_id == path_id)
        {
            let matches = self
                .table
                .get(&idx)
                .map(|entry| from.is_local() || Arc::ptr_eq(from, &entry.source))
                .unwrap_or(false);
            if matches {
                self.descending = None;
                if let Some(entry) = self.table.remove(&idx) {
                    return (vec![entry.source], false);
                }
            }
        }
        let idx = SnakeIndex {
            public_key: path_key,
            path_id,
        };
        let pair = self
            .table
            .get(&idx)
            .map(|entry| (entry.source.clone(), entry.destination.clone()));
        if let Some((source, destination)) = pair {
            if from.is_local() {
                // Local teardown of a duplicate path: both sides hear it.
                self.table.remove(&idx);
                return (vec![destination, source], false);
            }
            if Arc::ptr_eq(from, &source) {
                self.table.remove(&idx);
                return (vec![destination], false);
            }
            if Arc::ptr_eq(from, &destination) {
                self.table.remove(&idx);
                return (vec![source], false);
            }
        }
        (Vec::new(), false)
    }
}
