//! Contact transports and the temporary secrets used for forward-secret
//! connections.
//!
//! Secrets are keyed by (contact, transport, period).  Storing a batch of
//! fresh secrets retires stale periods: anything older than the period
//! before the newest stored period for the pair is deleted.

use rusqlite::{params, OptionalExtension};

use driftnet_shared::{ContactId, ContactTransport, TemporarySecret, TransportId};

use crate::database::Txn;
use crate::error::{Result, StoreError};

impl Txn<'_> {
    /// Record that the contact is reachable over the transport, with the
    /// given key rotation epoch and role.
    pub fn add_contact_transport(&self, ct: &ContactTransport) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contactTransports (contactId, transportId, epoch, alice)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (contactId, transportId)
             DO UPDATE SET epoch = excluded.epoch, alice = excluded.alice",
            params![ct.contact.0, ct.transport.as_str(), ct.epoch, ct.alice],
        )?;
        Ok(())
    }

    /// All (contact, transport) pairings, for rebuilding rotation state at
    /// startup.
    pub fn get_contact_transports(&self) -> Result<Vec<ContactTransport>> {
        let mut stmt = self.conn().prepare(
            "SELECT contactId, transportId, epoch, alice FROM contactTransports
             ORDER BY contactId, transportId",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ContactTransport {
                contact: ContactId(row.get(0)?),
                transport: TransportId(row.get(1)?),
                epoch: row.get(2)?,
                alice: row.get(3)?,
            })
        })?;

        let mut all = Vec::new();
        for row in rows {
            all.push(row?);
        }
        Ok(all)
    }

    /// Store a batch of temporary secrets, then delete stale periods for
    /// each (contact, transport) pair that received new ones.
    pub fn add_secrets(&self, secrets: &[TemporarySecret]) -> Result<()> {
        let mut insert = self.conn().prepare(
            "INSERT INTO secrets
             (contactId, transportId, period, secret, outgoing, centre, bitmap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (contactId, transportId, period)
             DO UPDATE SET secret = excluded.secret",
        )?;
        for s in secrets {
            insert.execute(params![
                s.contact.0,
                s.transport.as_str(),
                s.period,
                s.secret,
                s.outgoing,
                s.centre,
                s.bitmap,
            ])?;
        }
        let mut expire = self.conn().prepare(
            "DELETE FROM secrets WHERE contactId = ?1 AND transportId = ?2
             AND period < (SELECT MAX(period) FROM secrets
                           WHERE contactId = ?1 AND transportId = ?2) - 1",
        )?;
        for s in secrets {
            expire.execute(params![s.contact.0, s.transport.as_str()])?;
        }
        Ok(())
    }

    /// All stored temporary secrets.
    pub fn get_secrets(&self) -> Result<Vec<TemporarySecret>> {
        let mut stmt = self.conn().prepare(
            "SELECT contactId, transportId, period, secret, outgoing, centre, bitmap
             FROM secrets ORDER BY contactId, transportId, period",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TemporarySecret {
                contact: ContactId(row.get(0)?),
                transport: TransportId(row.get(1)?),
                period: row.get(2)?,
                secret: row.get(3)?,
                outgoing: row.get(4)?,
                centre: row.get(5)?,
                bitmap: row.get(6)?,
            })
        })?;

        let mut all = Vec::new();
        for row in rows {
            all.push(row?);
        }
        Ok(all)
    }

    /// Atomically read and increment the outgoing connection counter for
    /// the secret.  Returns the pre-increment value, or `None` if no
    /// secret is stored for the period.
    pub fn increment_connection_counter(
        &self,
        c: ContactId,
        t: &TransportId,
        period: i64,
    ) -> Result<Option<i64>> {
        let outgoing: Option<i64> = self
            .conn()
            .query_row(
                "SELECT outgoing FROM secrets
                 WHERE contactId = ?1 AND transportId = ?2 AND period = ?3",
                params![c.0, t.as_str(), period],
                |row| row.get(0),
            )
            .optional()?;
        let Some(outgoing) = outgoing else {
            return Ok(None);
        };
        self.conn().execute(
            "UPDATE secrets SET outgoing = outgoing + 1
             WHERE contactId = ?1 AND transportId = ?2 AND period = ?3",
            params![c.0, t.as_str(), period],
        )?;
        Ok(Some(outgoing))
    }

    /// Replace the replay-detection window for the secret.
    pub fn set_connection_window(
        &self,
        c: ContactId,
        t: &TransportId,
        period: i64,
        centre: i64,
        bitmap: &[u8],
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE secrets SET centre = ?1, bitmap = ?2
             WHERE contactId = ?3 AND transportId = ?4 AND period = ?5",
            params![centre, bitmap, c.0, t.as_str(), period],
        )?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    use super::*;

    fn secret(c: ContactId, t: &TransportId, period: i64) -> TemporarySecret {
        TemporarySecret {
            contact: c,
            transport: t.clone(),
            period,
            secret: vec![period as u8; 32],
            outgoing: 0,
            centre: 0,
            bitmap: vec![0; 4],
        }
    }

    fn setup(txn: &Txn<'_>) -> (ContactId, TransportId) {
        let c = txn.add_contact("alice").unwrap();
        let t = TransportId::new("tcp");
        txn.add_transport(&t).unwrap();
        txn.add_contact_transport(&ContactTransport {
            contact: c,
            transport: t.clone(),
            epoch: 1_000,
            alice: true,
        })
        .unwrap();
        (c, t)
    }

    #[test]
    fn contact_transports_round_trip() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let (c, t) = setup(&txn);

        let all = txn.get_contact_transports().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].contact, c);
        assert_eq!(all[0].transport, t);
        assert_eq!(all[0].epoch, 1_000);
        assert!(all[0].alice);
    }

    #[test]
    fn storing_new_secrets_retires_stale_periods() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let (c, t) = setup(&txn);

        txn.add_secrets(&[secret(c, &t, 0), secret(c, &t, 1), secret(c, &t, 2)])
            .unwrap();
        let periods: Vec<i64> = txn.get_secrets().unwrap().iter().map(|s| s.period).collect();
        assert_eq!(periods, vec![1, 2]);

        txn.add_secrets(&[secret(c, &t, 3)]).unwrap();
        let periods: Vec<i64> = txn.get_secrets().unwrap().iter().map(|s| s.period).collect();
        assert_eq!(periods, vec![2, 3]);
    }

    #[test]
    fn connection_counter_returns_pre_increment_value() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let (c, t) = setup(&txn);
        txn.add_secrets(&[secret(c, &t, 5)]).unwrap();

        assert_eq!(txn.increment_connection_counter(c, &t, 5).unwrap(), Some(0));
        assert_eq!(txn.increment_connection_counter(c, &t, 5).unwrap(), Some(1));
        assert_eq!(txn.increment_connection_counter(c, &t, 9).unwrap(), None);
    }

    #[test]
    fn connection_window_is_replaced() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let (c, t) = setup(&txn);
        txn.add_secrets(&[secret(c, &t, 5)]).unwrap();

        txn.set_connection_window(c, &t, 5, 7, &[1, 2, 3]).unwrap();
        let stored = txn.get_secrets().unwrap();
        assert_eq!(stored[0].centre, 7);
        assert_eq!(stored[0].bitmap, vec![1, 2, 3]);

        assert!(matches!(
            txn.set_connection_window(c, &t, 9, 0, &[]),
            Err(StoreError::NotFound)
        ));
    }
}
