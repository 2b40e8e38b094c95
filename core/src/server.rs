//! The snapshot protocol state machine.
//!
//! Servers exchange token messages and marker messages. Token messages
//! transfer tokens between servers; marker messages delimit the snapshot
//! cut on each channel. The bulk of the protocol lives in `handle_packet`
//! and `start_snapshot`.
//!
//! RULE: a server never touches links, the collector, or the trace
//! directly. Every entry point returns the list of `Action`s the
//! simulation loop must apply on the server's behalf. This keeps the
//! state machine pure and the one piece of cross-server shared state
//! (the collector) behind the simulator's ownership boundary.

use crate::error::{SimError, SimResult};
use crate::event::Message;
use crate::types::{ServerId, SnapshotId, TokenCount};
use std::collections::{BTreeMap, BTreeSet};

/// What a server asks the simulation loop to do on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue `message` on the outbound link to `dest`.
    Send { dest: ServerId, message: Message },
    /// Record this server's balance as its value for `snapshot_id`.
    RecordBalance {
        snapshot_id: SnapshotId,
        tokens: TokenCount,
    },
    /// Record a token message received on channel `src` as in transit
    /// for `snapshot_id`.
    RecordInTransit {
        snapshot_id: SnapshotId,
        src: ServerId,
        amount: TokenCount,
    },
    /// This server has seen markers on every inbound channel.
    SnapshotDone { snapshot_id: SnapshotId },
}

/// Bookkeeping for one snapshot in progress at one server.
/// Created lazily on initiation or on the first marker for the id;
/// retired once every inbound channel has delivered its marker.
#[derive(Debug, Default)]
struct SnapshotSession {
    /// Inbound channels whose marker has arrived. Token messages on a
    /// marked channel are no longer in transit for this snapshot.
    marked: BTreeSet<ServerId>,
}

/// The main participant of the distributed snapshot protocol.
#[derive(Debug)]
pub struct Server {
    pub id: ServerId,
    pub tokens: TokenCount,
    /// Outbound neighbors, sorted. Broadcast order follows this set so
    /// the trace is reproducible.
    outbound: BTreeSet<ServerId>,
    /// Inbound neighbors, sorted. The set size is the termination
    /// condition for every snapshot at this server.
    inbound: BTreeSet<ServerId>,
    sessions: BTreeMap<SnapshotId, SnapshotSession>,
    /// Snapshot ids this server has finished participating in. Kept so
    /// late markers stay recognizably stale instead of re-opening a
    /// session and double-recording.
    completed: BTreeSet<SnapshotId>,
}

impl Server {
    pub fn new(id: impl Into<ServerId>, tokens: TokenCount) -> Self {
        Self {
            id: id.into(),
            tokens,
            outbound: BTreeSet::new(),
            inbound: BTreeSet::new(),
            sessions: BTreeMap::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Register a directed link to `dest`. Self-links are ignored.
    /// The simulator wires both endpoints; see `Simulator::add_link`.
    pub fn add_outbound(&mut self, dest: &ServerId) {
        if *dest != self.id {
            self.outbound.insert(dest.clone());
        }
    }

    /// Register a directed link from `src`. Self-links are ignored.
    pub fn add_inbound(&mut self, src: &ServerId) {
        if *src != self.id {
            self.inbound.insert(src.clone());
        }
    }

    pub fn outbound_neighbors(&self) -> &BTreeSet<ServerId> {
        &self.outbound
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    /// Start the snapshot algorithm on this server: record the local
    /// balance, broadcast a marker on every outbound link, and begin
    /// counting inbound markers. Calling it again for an id this server
    /// already knows — active or completed — is a no-op, so a marker
    /// echoed back to the initiator never re-records or re-broadcasts.
    pub fn start_snapshot(&mut self, snapshot_id: SnapshotId) -> Vec<Action> {
        if self.sessions.contains_key(&snapshot_id) || self.completed.contains(&snapshot_id) {
            log::debug!(
                "server {}: snapshot {snapshot_id} already known, initiation ignored",
                self.id
            );
            return Vec::new();
        }
        let mut actions = self.open_session(snapshot_id);
        // A server with no inbound channels is done the moment it starts.
        actions.extend(self.check_complete(snapshot_id));
        actions
    }

    /// Callback for a message received on the inbound channel from `src`.
    pub fn handle_packet(&mut self, src: &ServerId, message: Message) -> Vec<Action> {
        match message {
            Message::Token { amount } => {
                self.tokens += amount;
                // The message is in transit for every snapshot whose
                // marker has not yet arrived on this channel.
                self.sessions
                    .iter()
                    .filter(|(_, session)| !session.marked.contains(src))
                    .map(|(snapshot_id, _)| Action::RecordInTransit {
                        snapshot_id: *snapshot_id,
                        src: src.clone(),
                        amount,
                    })
                    .collect()
            }
            Message::Marker { snapshot_id } => self.handle_marker(src, snapshot_id),
        }
    }

    /// Send `amount` tokens to the neighbor `dest`. The balance drops
    /// before the message is queued, so held + in-flight never
    /// double-counts.
    pub fn send_tokens(&mut self, amount: TokenCount, dest: &ServerId) -> SimResult<Vec<Action>> {
        if amount > self.tokens {
            return Err(SimError::InsufficientTokens {
                server: self.id.clone(),
                requested: amount,
                held: self.tokens,
            });
        }
        if !self.outbound.contains(dest) {
            return Err(SimError::UnknownNeighbor {
                server: self.id.clone(),
                dest: dest.clone(),
            });
        }
        self.tokens -= amount;
        Ok(vec![Action::Send {
            dest: dest.clone(),
            message: Message::Token { amount },
        }])
    }

    /// Emit one send per outbound link, in sorted neighbor order.
    pub fn send_to_neighbors(&self, message: Message) -> Vec<Action> {
        self.outbound
            .iter()
            .map(|dest| Action::Send {
                dest: dest.clone(),
                message: message.clone(),
            })
            .collect()
    }

    /// Record the local balance and broadcast the marker. The session
    /// entry doubles as the record-once guard: it exists iff this server
    /// has recorded its state for the id.
    fn open_session(&mut self, snapshot_id: SnapshotId) -> Vec<Action> {
        self.sessions.insert(snapshot_id, SnapshotSession::default());
        let mut actions = vec![Action::RecordBalance {
            snapshot_id,
            tokens: self.tokens,
        }];
        actions.extend(self.send_to_neighbors(Message::Marker { snapshot_id }));
        actions
    }

    fn handle_marker(&mut self, src: &ServerId, snapshot_id: SnapshotId) -> Vec<Action> {
        if self.completed.contains(&snapshot_id) {
            // Cannot happen on FIFO links with a single broadcast per
            // server; kept explicit rather than falling through.
            log::warn!(
                "server {}: marker for completed snapshot {snapshot_id} on channel {src}, ignored",
                self.id
            );
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.sessions.contains_key(&snapshot_id) {
            // First marker ever seen for this id: record state now and
            // propagate the cut.
            actions = self.open_session(snapshot_id);
        }

        if let Some(session) = self.sessions.get_mut(&snapshot_id) {
            if !session.marked.insert(src.clone()) {
                // Duplicate marker on an already-marked channel — a
                // protocol anomaly under FIFO/single-broadcast, dropped.
                log::warn!(
                    "server {}: duplicate marker for snapshot {snapshot_id} on channel {src}, ignored",
                    self.id
                );
                return actions;
            }
        }

        actions.extend(self.check_complete(snapshot_id));
        actions
    }

    /// Retire the session and report completion once markers have
    /// arrived on every inbound channel. Runs at most once per id:
    /// retirement moves the id to `completed`, and completed ids never
    /// re-enter `sessions`.
    fn check_complete(&mut self, snapshot_id: SnapshotId) -> Option<Action> {
        let done = self
            .sessions
            .get(&snapshot_id)
            .is_some_and(|session| session.marked.len() == self.inbound.len());
        if !done {
            return None;
        }
        self.sessions.remove(&snapshot_id);
        self.completed.insert(snapshot_id);
        Some(Action::SnapshotDone { snapshot_id })
    }
}
