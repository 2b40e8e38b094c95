//! Shared primitive types used across the entire simulation.

/// A simulation tick. One tick = one scheduler step of the event loop.
pub type Tick = u64;

/// A stable, unique identifier for a server ("A", "B", ...).
pub type ServerId = String;

/// A snapshot identifier. The harness guarantees uniqueness per run.
pub type SnapshotId = u64;

/// The canonical run identifier.
pub type RunId = String;

/// A non-negative count of tokens, held or in flight.
pub type TokenCount = u64;
