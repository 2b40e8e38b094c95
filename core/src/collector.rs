//! The shared aggregation store for snapshot results.
//!
//! RULE: Only the simulation loop writes here, by applying server
//! actions. Servers never hold a reference to the collector — it is the
//! single piece of cross-server shared state, and it lives behind the
//! simulator's ownership boundary.

use crate::error::{SimError, SimResult};
use crate::types::{ServerId, SnapshotId, TokenCount};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A token message caught between the cut points of its two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InTransitMessage {
    pub src: ServerId,
    pub dest: ServerId,
    pub amount: TokenCount,
}

/// A fully collected snapshot: every server's recorded balance plus
/// every recorded in-flight message.
#[derive(Debug, Clone, Serialize)]
pub struct CollectedSnapshot {
    pub snapshot_id: SnapshotId,
    pub tokens: BTreeMap<ServerId, TokenCount>,
    pub messages: Vec<InTransitMessage>,
}

impl CollectedSnapshot {
    /// Recorded balances plus recorded in-flight tokens. For a correct
    /// snapshot this equals the total that existed in the system.
    pub fn total_tokens(&self) -> TokenCount {
        let held: TokenCount = self.tokens.values().sum();
        let in_transit: TokenCount = self.messages.iter().map(|m| m.amount).sum();
        held + in_transit
    }
}

#[derive(Debug, Default)]
pub struct SnapshotCollector {
    tokens: BTreeMap<SnapshotId, BTreeMap<ServerId, TokenCount>>,
    messages: BTreeMap<SnapshotId, Vec<InTransitMessage>>,
    reported: BTreeMap<SnapshotId, BTreeSet<ServerId>>,
}

impl SnapshotCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server's balance for a snapshot. First write wins: the
    /// server-side session guard already makes a second write
    /// impossible, so one arriving here is worth a warning.
    pub fn record_balance(&mut self, snapshot_id: SnapshotId, server: &ServerId, tokens: TokenCount) {
        let entry = self.tokens.entry(snapshot_id).or_default();
        if entry.contains_key(server) {
            log::warn!(
                "snapshot {snapshot_id}: balance for server {server} already recorded, keeping first value"
            );
            return;
        }
        entry.insert(server.clone(), tokens);
    }

    pub fn record_in_transit(&mut self, snapshot_id: SnapshotId, message: InTransitMessage) {
        self.messages.entry(snapshot_id).or_default().push(message);
    }

    /// Record that `server` finished participating in `snapshot_id`.
    /// Returns true only on the first report for the pair.
    pub fn notify_complete(&mut self, server: &ServerId, snapshot_id: SnapshotId) -> bool {
        self.reported
            .entry(snapshot_id)
            .or_default()
            .insert(server.clone())
    }

    pub fn reported_count(&self, snapshot_id: SnapshotId) -> usize {
        self.reported.get(&snapshot_id).map_or(0, BTreeSet::len)
    }

    pub fn is_complete(&self, snapshot_id: SnapshotId, expected_servers: usize) -> bool {
        self.reported_count(snapshot_id) == expected_servers
    }

    /// Snapshot ids that have received at least one report.
    pub fn known_snapshots(&self) -> Vec<SnapshotId> {
        self.reported.keys().copied().collect()
    }

    /// Assemble the completed snapshot, or fail with the reported and
    /// expected participant counts.
    pub fn collect(&self, snapshot_id: SnapshotId, expected_servers: usize) -> SimResult<CollectedSnapshot> {
        if !self.is_complete(snapshot_id, expected_servers) {
            return Err(SimError::SnapshotIncomplete {
                snapshot_id,
                reported: self.reported_count(snapshot_id),
                expected: expected_servers,
            });
        }
        Ok(CollectedSnapshot {
            snapshot_id,
            tokens: self.tokens.get(&snapshot_id).cloned().unwrap_or_default(),
            messages: self.messages.get(&snapshot_id).cloned().unwrap_or_default(),
        })
    }
}
