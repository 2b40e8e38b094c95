use crate::types::{ServerId, SnapshotId, TokenCount};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server '{server}' attempted to send {requested} tokens but holds only {held}")]
    InsufficientTokens {
        server: ServerId,
        requested: TokenCount,
        held: TokenCount,
    },

    #[error("Server '{server}' has no outbound link to '{dest}'")]
    UnknownNeighbor { server: ServerId, dest: ServerId },

    #[error("Unknown server '{id}'")]
    UnknownServer { id: ServerId },

    #[error("Server '{id}' already registered")]
    DuplicateServer { id: ServerId },

    #[error("Snapshot {snapshot_id} is incomplete: {reported} of {expected} servers reported")]
    SnapshotIncomplete {
        snapshot_id: SnapshotId,
        reported: usize,
        expected: usize,
    },

    #[error("Invalid scenario: {reason}")]
    InvalidScenario { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SimResult<T> = Result<T, SimError>;
