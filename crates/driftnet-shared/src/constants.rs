/// Maximum serialized message size in bytes (64 KiB).
pub const MAX_MESSAGE_LENGTH: usize = 65_536;

/// Maximum number of group subscriptions.
pub const MAX_SUBSCRIPTIONS: usize = 3_000;

/// Maximum number of message ids in a single ack payload.
pub const MAX_MESSAGES_PER_ACK: usize = 1_000;

/// Maximum number of message ids in a single offer payload.
pub const MAX_MESSAGES_PER_OFFER: usize = 1_000;

/// Retention times are rounded down to a multiple of this before being
/// advertised, so they leak less about local message timing (1 hour).
pub const RETENTION_MODULUS_MS: i64 = 60 * 60 * 1_000;

/// Default database capacity in bytes (1 GiB).
pub const DEFAULT_DB_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Free space below which the cleaner starts expiring old messages (20 MiB).
pub const DEFAULT_MIN_FREE_SPACE: u64 = 20 * 1024 * 1024;

/// Free space below which new writes are blocked (5 MiB).
pub const DEFAULT_CRITICAL_FREE_SPACE: u64 = 5 * 1024 * 1024;

/// Bytes stored since the last check that force a new space check (5 MiB).
pub const DEFAULT_MAX_BYTES_BETWEEN_SPACE_CHECKS: u64 = 5 * 1024 * 1024;

/// Time since the last check that forces a new space check (5 minutes).
pub const DEFAULT_MAX_MS_BETWEEN_SPACE_CHECKS: i64 = 5 * 60 * 1_000;

/// Maximum bytes expired in one cleaner sweep (5 MiB).
pub const DEFAULT_BYTES_PER_SWEEP: u64 = 5 * 1024 * 1024;

/// Interval between cleaner wake-ups (10 seconds).
pub const DEFAULT_MS_BETWEEN_SWEEPS: u64 = 10 * 1_000;
