//! Engine configuration.  Every threshold the engine consults at runtime
//! lives here; the compiled defaults are in `driftnet_shared::constants`.

use driftnet_shared::constants::{
    DEFAULT_BYTES_PER_SWEEP, DEFAULT_CRITICAL_FREE_SPACE, DEFAULT_DB_CAPACITY,
    DEFAULT_MAX_BYTES_BETWEEN_SPACE_CHECKS, DEFAULT_MAX_MS_BETWEEN_SPACE_CHECKS,
    DEFAULT_MIN_FREE_SPACE, DEFAULT_MS_BETWEEN_SWEEPS, MAX_MESSAGES_PER_ACK,
    MAX_MESSAGES_PER_OFFER,
};

/// Tunable thresholds for the engine and its space cleaner.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum size of the message store in bytes.  Free space is the
    /// capacity minus the total size of stored messages.
    pub capacity: u64,
    /// Free space below which the cleaner expires old messages.
    pub min_free_space: u64,
    /// Free space below which new local writes block.
    pub critical_free_space: u64,
    /// Bytes stored since the last space check that force a new one.
    pub max_bytes_between_space_checks: u64,
    /// Elapsed time since the last space check that forces a new one.
    pub max_ms_between_space_checks: i64,
    /// Maximum bytes expired per cleaner sweep.
    pub bytes_per_sweep: u64,
    /// Interval between cleaner wake-ups.
    pub ms_between_sweeps: u64,
    /// Maximum message ids per outgoing or incoming ack payload.
    pub max_messages_per_ack: usize,
    /// Maximum message ids per outgoing or incoming offer payload.
    pub max_messages_per_offer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_DB_CAPACITY,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            critical_free_space: DEFAULT_CRITICAL_FREE_SPACE,
            max_bytes_between_space_checks: DEFAULT_MAX_BYTES_BETWEEN_SPACE_CHECKS,
            max_ms_between_space_checks: DEFAULT_MAX_MS_BETWEEN_SPACE_CHECKS,
            bytes_per_sweep: DEFAULT_BYTES_PER_SWEEP,
            ms_between_sweeps: DEFAULT_MS_BETWEEN_SWEEPS,
            max_messages_per_ack: MAX_MESSAGES_PER_ACK,
            max_messages_per_offer: MAX_MESSAGES_PER_OFFER,
        }
    }
}
