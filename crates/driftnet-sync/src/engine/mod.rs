//! The synchronization engine.
//!
//! One [`SyncEngine`] owns the store, the lock manager and the event bus.
//! Every public operation names its lock set at the top of the function,
//! runs its store work inside a single transaction, and fires events only
//! after the transaction has committed and all locks are released.

mod contacts;
mod groups;
mod messages;
mod sync;
mod transports;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use driftnet_shared::ContactId;
use driftnet_store::{Database, StoreError, Txn};

use crate::cleaner::{Cleaner, CleanerCallback};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{DbError, Result};
use crate::event::{Event, EventBus};
use crate::locks::LockManager;

/// Bytes stored and time elapsed since the last free-space check.
struct SpaceTracker {
    bytes_since_check: u64,
    last_check_ms: i64,
}

pub struct SyncEngine {
    db: Mutex<Database>,
    locks: LockManager,
    events: EventBus,
    config: SyncConfig,
    clock: Box<dyn Clock>,
    space: Mutex<SpaceTracker>,
    /// False while free space is below the critical threshold; local
    /// writes block on the condvar until the cleaner recovers space.
    writes_allowed: Mutex<bool>,
    write_cond: Condvar,
}

impl SyncEngine {
    /// Open (or create) an engine over an on-disk store.
    pub fn open(path: &Path, config: SyncConfig) -> Result<Arc<Self>> {
        let db = Database::open_at(path, config.capacity)?;
        Ok(Self::with_database(db, config, Box::new(SystemClock)))
    }

    /// Open an engine over an in-memory store.  Used by tests.
    pub fn open_in_memory(config: SyncConfig) -> Result<Arc<Self>> {
        let db = Database::open_in_memory(config.capacity)?;
        Ok(Self::with_database(db, config, Box::new(SystemClock)))
    }

    /// Build an engine from an already-open database and an explicit time
    /// source.
    pub fn with_database(db: Database, config: SyncConfig, clock: Box<dyn Clock>) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(Self {
            db: Mutex::new(db),
            locks: LockManager::new(),
            events: EventBus::new(),
            config,
            clock,
            space: Mutex::new(SpaceTracker {
                bytes_since_check: 0,
                last_check_ms: now,
            }),
            writes_allowed: Mutex::new(true),
            write_cond: Condvar::new(),
        })
    }

    /// Spawn the background cleaner for this engine.
    pub fn start_cleaner(self: &Arc<Self>) -> Result<Cleaner> {
        Cleaner::start(
            self.clone(),
            Duration::from_millis(self.config.ms_between_sweeps),
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Free storage space in bytes.
    pub fn free_space(&self) -> Result<u64> {
        self.with_txn(|txn| Ok(txn.free_space()?))
    }

    // -----------------------------------------------------------------
    // Internal plumbing
    // -----------------------------------------------------------------

    /// Run store work in one transaction, committing on success.  A failed
    /// closure drops the transaction, which rolls back.
    fn with_txn<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let mut db = self.db.lock();
        let txn = db.transaction()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Count bytes written since the last space check.
    fn record_stored_bytes(&self, bytes: u64) {
        self.space.lock().bytes_since_check += bytes;
    }

    /// Block until free space is above the critical threshold.
    fn wait_for_permission_to_write(&self) {
        let mut allowed = self.writes_allowed.lock();
        while !*allowed {
            tracing::warn!("local write blocked until space recovers");
            self.write_cond.wait(&mut allowed);
        }
    }

    /// Open or close the write gate, waking blocked writers on reopen.
    fn set_writes_allowed(&self, allowed: bool) {
        let mut guard = self.writes_allowed.lock();
        if allowed && !*guard {
            self.write_cond.notify_all();
        }
        *guard = allowed;
    }

    fn ensure_contact(&self, txn: &Txn<'_>, c: ContactId) -> Result<()> {
        if !txn.contains_contact(c)? {
            return Err(DbError::NoSuchContact(c));
        }
        Ok(())
    }
}

/// Map a store-level `NotFound` to a typed engine error.
fn map_not_found<T>(
    result: driftnet_store::Result<T>,
    err: impl FnOnce() -> DbError,
) -> Result<T> {
    result.map_err(|e| match e {
        StoreError::NotFound => err(),
        other => DbError::Store(other),
    })
}

impl CleanerCallback for SyncEngine {
    fn should_check_free_space(&self) -> bool {
        let space = self.space.lock();
        let elapsed = self.clock.now_ms() - space.last_check_ms;
        space.bytes_since_check >= self.config.max_bytes_between_space_checks
            || elapsed >= self.config.max_ms_between_space_checks
    }

    fn check_free_space_and_clean(&self) -> Result<()> {
        {
            let mut space = self.space.lock();
            space.bytes_since_check = 0;
            space.last_check_ms = self.clock.now_ms();
        }

        let mut free = self.free_space()?;
        while free < self.config.min_free_space {
            // Close the gate as soon as space is critical; a sweep that
            // recovers enough space reopens it below.
            self.set_writes_allowed(free >= self.config.critical_free_space);
            let expired = self.expire_sweep()?;
            if expired == 0 {
                if free < self.config.critical_free_space {
                    tracing::error!(free, "critically low on space with nothing to expire");
                    return Err(DbError::CriticalSpace);
                }
                break;
            }
            tracing::info!(expired, free, "expired old messages");
            self.events.emit(&Event::MessagesExpired(expired));
            free = self.free_space()?;
        }
        self.set_writes_allowed(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use driftnet_shared::Message;

    use crate::clock::ManualClock;

    use super::*;

    fn tiny_engine(capacity: u64, min_free: u64, critical: u64) -> Arc<SyncEngine> {
        let config = SyncConfig {
            capacity,
            min_free_space: min_free,
            critical_free_space: critical,
            bytes_per_sweep: 8,
            ..SyncConfig::default()
        };
        let db = Database::open_in_memory(config.capacity).unwrap();
        SyncEngine::with_database(db, config, Box::new(ManualClock::new(1_000_000)))
    }

    #[test]
    fn space_check_is_due_after_bytes_or_time() {
        let config = SyncConfig {
            max_bytes_between_space_checks: 100,
            max_ms_between_space_checks: 1_000,
            ..SyncConfig::default()
        };
        let clock = Box::new(ManualClock::new(0));
        let db = Database::open_in_memory(config.capacity).unwrap();
        let engine = SyncEngine::with_database(db, config, clock);

        assert!(!engine.should_check_free_space());
        engine.record_stored_bytes(100);
        assert!(engine.should_check_free_space());

        engine.check_free_space_and_clean().unwrap();
        assert!(!engine.should_check_free_space());
    }

    #[test]
    fn cleaning_expires_oldest_until_space_recovers() {
        // 64 bytes of capacity, start cleaning below 32 free.
        let engine = tiny_engine(64, 32, 8);
        let c = engine.add_contact("alice").unwrap();

        for ts in 0..6 {
            let m = Message::new(None, None, None, ts, vec![ts as u8; 8]);
            engine.store_local_private_message(m, c).unwrap();
        }
        // 48 bytes stored, 16 free.
        assert_eq!(engine.free_space().unwrap(), 16);

        engine.check_free_space_and_clean().unwrap();
        assert!(engine.free_space().unwrap() >= 32);

        // The oldest messages are the ones that went.
        let remaining = engine.get_private_message_headers(c).unwrap();
        assert!(remaining.iter().all(|h| h.timestamp >= 2));
    }

    #[test]
    fn writers_block_while_space_is_critical_and_resume_when_it_recovers() {
        use driftnet_shared::Group;

        // A sweep budget of zero means cleaning can never expire anything,
        // so the first check leaves the write gate closed.
        let config = SyncConfig {
            capacity: 64,
            min_free_space: 32,
            critical_free_space: 32,
            bytes_per_sweep: 0,
            ..SyncConfig::default()
        };
        let db = Database::open_in_memory(config.capacity).unwrap();
        let engine = SyncEngine::with_database(db, config, Box::new(ManualClock::new(1_000_000)));
        let c = engine.add_contact("alice").unwrap();
        let g = Group::new("bulk", None);
        engine.subscribe(&g).unwrap();
        for ts in 0..6 {
            let m = Message::new(None, Some(g.id), None, ts, vec![ts as u8; 8]);
            engine.store_local_group_message(m).unwrap();
        }
        // 48 bytes stored, 16 free: below the critical threshold.
        assert!(matches!(
            engine.check_free_space_and_clean(),
            Err(DbError::CriticalSpace)
        ));

        let writer = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let m = Message::new(None, None, None, 50, vec![9u8; 8]);
                engine.store_local_private_message(m, c).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(!writer.is_finished());

        // Unsubscribing frees the group's messages; the next check finds
        // enough space and reopens the gate.
        engine.unsubscribe(g.id).unwrap();
        engine.check_free_space_and_clean().unwrap();
        writer.join().unwrap();
        assert_eq!(engine.get_private_message_headers(c).unwrap().len(), 1);
    }

    #[test]
    fn critical_space_with_nothing_to_expire_is_fatal() {
        let engine = tiny_engine(64, 32, 8);
        // Capacity nearly exhausted by nothing we can expire: shrink the
        // thresholds instead by storing nothing and faking a tiny capacity.
        let engine_empty = tiny_engine(4, 32, 8);
        assert!(matches!(
            engine_empty.check_free_space_and_clean(),
            Err(DbError::CriticalSpace)
        ));
        // With room to expire, the same call succeeds.
        let c = engine.add_contact("alice").unwrap();
        for ts in 0..5 {
            let m = Message::new(None, None, None, ts, vec![ts as u8; 8]);
            engine.store_local_private_message(m, c).unwrap();
        }
        engine.check_free_space_and_clean().unwrap();
    }
}
