//! Wire messages and the trace event log.
//!
//! RULE: Servers communicate ONLY through messages on links.
//! A server may never call another server's functions directly.
//! A server may never read another server's internal state.

use crate::types::{RunId, ServerId, SnapshotId, Tick, TokenCount};
use serde::{Deserialize, Serialize};

/// Everything that travels on a link. Matched exhaustively at the
/// single dispatch point in `Server::handle_packet` — a new kind
/// fails to compile until every handler covers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Transfer of a positive number of tokens.
    Token { amount: TokenCount },
    /// Snapshot cut delimiter for one channel.
    Marker { snapshot_id: SnapshotId },
}

/// Every event appended to the trace log.
/// Variants are added as the system grows — never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    // ── Run lifecycle ──────────────────────────────
    RunInitialized {
        run_id: RunId,
        seed: u64,
    },

    // ── Message traffic ────────────────────────────
    MessageSent {
        tick: Tick,
        src: ServerId,
        dest: ServerId,
        message: Message,
    },
    MessageReceived {
        tick: Tick,
        src: ServerId,
        dest: ServerId,
        message: Message,
    },

    // ── Snapshot protocol ──────────────────────────
    SnapshotInitiated {
        tick: Tick,
        server: ServerId,
        snapshot_id: SnapshotId,
    },
    StateRecorded {
        tick: Tick,
        server: ServerId,
        snapshot_id: SnapshotId,
        tokens: TokenCount,
    },
    InTransitRecorded {
        tick: Tick,
        snapshot_id: SnapshotId,
        src: ServerId,
        dest: ServerId,
        amount: TokenCount,
    },
    ServerSnapshotComplete {
        tick: Tick,
        server: ServerId,
        snapshot_id: SnapshotId,
    },
}

/// The trace log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub tick: Tick,
    pub server: ServerId,
    pub event_type: String,
    pub payload: String, // JSON-serialized SimEvent
}
