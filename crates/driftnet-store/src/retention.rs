//! The retention-time side of the versioned exchange.
//!
//! The local retention time advertised to peers is the timestamp of the
//! oldest stored message, rounded down to [`RETENTION_MODULUS_MS`] so it
//! leaks less about local message timing.  Sweeps that expire messages
//! bump every contact's local version, making fresh updates due.

use rusqlite::{params, OptionalExtension};

use driftnet_shared::constants::RETENTION_MODULUS_MS;
use driftnet_shared::protocol::{RetentionAck, RetentionUpdate};
use driftnet_shared::ContactId;

use crate::database::Txn;
use crate::error::Result;

impl Txn<'_> {
    /// Return a retention ack for the contact, or `None` if none is due.
    /// Returning the ack records it as sent.
    pub fn get_retention_ack(&self, c: ContactId) -> Result<Option<RetentionAck>> {
        let version: Option<i64> = self
            .conn()
            .query_row(
                "SELECT remoteVersion FROM retentionVersions
                 WHERE contactId = ?1 AND remoteAcked = 0",
                params![c.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Ok(None);
        };
        self.conn().execute(
            "UPDATE retentionVersions SET remoteAcked = 1 WHERE contactId = ?1",
            params![c.0],
        )?;
        Ok(Some(RetentionAck {
            version: version as u64,
        }))
    }

    /// Return a retention update for the contact, or `None` if none is
    /// due.  The advertised retention time is the oldest stored message's
    /// timestamp rounded down, or 0 if no messages are stored.
    pub fn get_retention_update(&self, c: ContactId) -> Result<Option<RetentionUpdate>> {
        let version: Option<i64> = self
            .conn()
            .query_row(
                "SELECT localVersion FROM retentionVersions
                 WHERE contactId = ?1 AND localVersion > localAcked",
                params![c.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Ok(None);
        };
        let oldest: Option<i64> = self.conn().query_row(
            "SELECT MIN(timestamp) FROM messages",
            [],
            |row| row.get(0),
        )?;
        let retention = match oldest {
            Some(t) => t - t.rem_euclid(RETENTION_MODULUS_MS),
            None => 0,
        };
        Ok(Some(RetentionUpdate {
            retention,
            version: version as u64,
        }))
    }

    /// Record the contact's advertised retention time, unless an update
    /// with an equal or higher version has already been applied.  Returns
    /// true if the update was applied.  A repeat of the current version
    /// still re-arms the ack, covering a lost ack.
    pub fn set_retention_time(&self, c: ContactId, retention: i64, version: u64) -> Result<bool> {
        self.conn().execute(
            "UPDATE retentionVersions SET remoteAcked = 0
             WHERE contactId = ?2 AND remoteVersion <= ?1",
            params![version as i64, c.0],
        )?;
        let affected = self.conn().execute(
            "UPDATE retentionVersions SET retention = ?1, remoteVersion = ?2
             WHERE contactId = ?3 AND remoteVersion < ?2",
            params![retention, version as i64, c.0],
        )?;
        Ok(affected == 1)
    }

    /// Record a retention ack from the contact, unless it acks a version
    /// outside `(localAcked, localVersion]`.
    pub fn set_retention_update_acked(&self, c: ContactId, version: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE retentionVersions SET localAcked = ?1
             WHERE contactId = ?2 AND localAcked < ?1 AND localVersion >= ?1",
            params![version as i64, c.0],
        )?;
        Ok(())
    }

    /// Bump every contact's local retention version after a sweep has
    /// changed the oldest stored message.
    pub fn increment_retention_versions(&self) -> Result<()> {
        self.conn().execute(
            "UPDATE retentionVersions SET localVersion = localVersion + 1",
            [],
        )?;
        Ok(())
    }

    /// The contact's advertised retention time (0 = keep everything).
    pub fn get_retention_time(&self, c: ContactId) -> Result<i64> {
        let retention: i64 = self.conn().query_row(
            "SELECT retention FROM retentionVersions WHERE contactId = ?1",
            params![c.0],
            |row| row.get(0),
        )?;
        Ok(retention)
    }
}
