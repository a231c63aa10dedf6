//! Transport plugins: local configuration, advertised properties, remote
//! properties, and the transport side of the versioned exchange.
//!
//! The local side keeps one `transportVersions` row per (contact, local
//! transport); the remote side keeps one `contactTransportVersions` row per
//! (contact, remote transport).  The remote transport id carries no foreign
//! key because we may not run that transport ourselves.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use driftnet_shared::protocol::{TransportAck, TransportUpdate};
use driftnet_shared::{ContactId, TransportConfig, TransportId, TransportProperties};

use crate::database::Txn;
use crate::error::{Result, StoreError};

impl Txn<'_> {
    /// Register a transport plugin.  Returns false if it already exists.
    /// Seeds a local version row per contact so an update becomes due.
    pub fn add_transport(&self, t: &TransportId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO transports (transportId) VALUES (?1)",
            params![t.as_str()],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        self.conn().execute(
            "INSERT INTO transportVersions (contactId, transportId, localVersion, localAcked)
             SELECT contactId, ?1, 1, 0 FROM contacts",
            params![t.as_str()],
        )?;
        Ok(true)
    }

    pub fn contains_transport(&self, t: &TransportId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM transports WHERE transportId = ?1",
            params![t.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Unregister a transport.  Its config, properties, version rows,
    /// contact transports and secrets cascade.
    pub fn remove_transport(&self, t: &TransportId) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM transports WHERE transportId = ?1",
            params![t.as_str()],
        )?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Ids of all registered transports.
    pub fn get_transport_ids(&self) -> Result<Vec<TransportId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT transportId FROM transports ORDER BY transportId")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(TransportId(row?));
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------
    // Local configuration (never shared with peers)
    // -----------------------------------------------------------------

    pub fn get_config(&self, t: &TransportId) -> Result<TransportConfig> {
        self.get_key_values(
            "SELECT key, value FROM transportConfigs WHERE transportId = ?1",
            t,
        )
    }

    /// Merge key-value pairs into the transport's local configuration.
    pub fn merge_config(&self, t: &TransportId, config: &TransportConfig) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "INSERT INTO transportConfigs (transportId, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (transportId, key) DO UPDATE SET value = excluded.value",
        )?;
        for (key, value) in config {
            stmt.execute(params![t.as_str(), key, value])?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Local properties (advertised to contacts)
    // -----------------------------------------------------------------

    pub fn get_local_properties(&self, t: &TransportId) -> Result<TransportProperties> {
        self.get_key_values(
            "SELECT key, value FROM transportProperties WHERE transportId = ?1",
            t,
        )
    }

    /// Merge key-value pairs into the transport's advertised properties.
    /// If anything changed, every contact's local version for the transport
    /// is bumped so fresh updates become due.
    pub fn merge_local_properties(
        &self,
        t: &TransportId,
        properties: &TransportProperties,
    ) -> Result<()> {
        let before = self.get_local_properties(t)?;
        let mut stmt = self.conn().prepare(
            "INSERT INTO transportProperties (transportId, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (transportId, key) DO UPDATE SET value = excluded.value",
        )?;
        let mut changed = false;
        for (key, value) in properties {
            if before.get(key) != Some(value) {
                changed = true;
            }
            stmt.execute(params![t.as_str(), key, value])?;
        }
        if changed {
            self.conn().execute(
                "UPDATE transportVersions SET localVersion = localVersion + 1
                 WHERE transportId = ?1",
                params![t.as_str()],
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Remote properties (advertised by contacts)
    // -----------------------------------------------------------------

    /// Each contact's advertised properties for the transport.
    pub fn get_remote_properties(
        &self,
        t: &TransportId,
    ) -> Result<BTreeMap<ContactId, TransportProperties>> {
        let mut stmt = self.conn().prepare(
            "SELECT contactId, key, value FROM contactTransportProperties
             WHERE transportId = ?1 ORDER BY contactId",
        )?;
        let rows = stmt.query_map(params![t.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut all: BTreeMap<ContactId, TransportProperties> = BTreeMap::new();
        for row in rows {
            let (contact, key, value) = row?;
            all.entry(ContactId(contact)).or_default().insert(key, value);
        }
        Ok(all)
    }

    /// Replace the contact's advertised properties for one of its
    /// transports, unless an update with an equal or higher version has
    /// already been applied.  Returns true if the update was applied.
    pub fn set_remote_properties(
        &self,
        c: ContactId,
        t: &TransportId,
        properties: &TransportProperties,
        version: u64,
    ) -> Result<bool> {
        let current: Option<i64> = self
            .conn()
            .query_row(
                "SELECT remoteVersion FROM contactTransportVersions
                 WHERE contactId = ?1 AND transportId = ?2",
                params![c.0, t.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = current {
            if current > version as i64 {
                return Ok(false);
            }
            if current == version as i64 {
                // Not re-applied, but the ack may have been lost.
                self.conn().execute(
                    "UPDATE contactTransportVersions SET remoteAcked = 0
                     WHERE contactId = ?1 AND transportId = ?2",
                    params![c.0, t.as_str()],
                )?;
                return Ok(false);
            }
        }
        self.conn().execute(
            "INSERT INTO contactTransportVersions
             (contactId, transportId, remoteVersion, remoteAcked)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT (contactId, transportId)
             DO UPDATE SET remoteVersion = excluded.remoteVersion, remoteAcked = 0",
            params![c.0, t.as_str(), version as i64],
        )?;
        self.conn().execute(
            "DELETE FROM contactTransportProperties
             WHERE contactId = ?1 AND transportId = ?2",
            params![c.0, t.as_str()],
        )?;
        let mut stmt = self.conn().prepare(
            "INSERT INTO contactTransportProperties (contactId, transportId, key, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (key, value) in properties {
            stmt.execute(params![c.0, t.as_str(), key, value])?;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Versioned exchange
    // -----------------------------------------------------------------

    /// Transport acks due to the contact, one per transport with an
    /// unacked remote update.  Returning the acks records them as sent.
    pub fn get_transport_acks(&self, c: ContactId) -> Result<Vec<TransportAck>> {
        let mut stmt = self.conn().prepare(
            "SELECT transportId, remoteVersion FROM contactTransportVersions
             WHERE contactId = ?1 AND remoteAcked = 0 ORDER BY transportId",
        )?;
        let rows = stmt.query_map(params![c.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut acks = Vec::new();
        for row in rows {
            let (transport, version) = row?;
            acks.push(TransportAck {
                transport: TransportId(transport),
                version: version as u64,
            });
        }
        if !acks.is_empty() {
            self.conn().execute(
                "UPDATE contactTransportVersions SET remoteAcked = 1 WHERE contactId = ?1",
                params![c.0],
            )?;
        }
        Ok(acks)
    }

    /// Transport updates due to the contact, one per local transport with
    /// `localVersion > localAcked`, carrying the current properties.
    pub fn get_transport_updates(&self, c: ContactId) -> Result<Vec<TransportUpdate>> {
        let mut stmt = self.conn().prepare(
            "SELECT transportId, localVersion FROM transportVersions
             WHERE contactId = ?1 AND localVersion > localAcked ORDER BY transportId",
        )?;
        let rows = stmt.query_map(params![c.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut due = Vec::new();
        for row in rows {
            let (transport, version) = row?;
            let transport = TransportId(transport);
            let properties = self.get_local_properties(&transport)?;
            due.push(TransportUpdate {
                transport,
                properties,
                version: version as u64,
            });
        }
        Ok(due)
    }

    /// Record a transport ack from the contact, unless it acks a version
    /// outside `(localAcked, localVersion]`.
    pub fn set_transport_update_acked(
        &self,
        c: ContactId,
        t: &TransportId,
        version: u64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE transportVersions SET localAcked = ?1
             WHERE contactId = ?2 AND transportId = ?3
             AND localAcked < ?1 AND localVersion >= ?1",
            params![version as i64, c.0, t.as_str()],
        )?;
        Ok(())
    }

    fn get_key_values(&self, sql: &str, t: &TransportId) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![t.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    use super::*;

    fn props(pairs: &[(&str, &str)]) -> TransportProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn config_and_properties_merge() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let t = TransportId::new("tcp");
        assert!(txn.add_transport(&t).unwrap());
        assert!(!txn.add_transport(&t).unwrap());

        txn.merge_config(&t, &props(&[("timeout", "30")])).unwrap();
        txn.merge_config(&t, &props(&[("timeout", "60"), ("retries", "3")]))
            .unwrap();
        assert_eq!(
            txn.get_config(&t).unwrap(),
            props(&[("timeout", "60"), ("retries", "3")])
        );

        txn.merge_local_properties(&t, &props(&[("port", "7000")]))
            .unwrap();
        assert_eq!(
            txn.get_local_properties(&t).unwrap(),
            props(&[("port", "7000")])
        );
    }

    #[test]
    fn property_change_makes_update_due_again() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let t = TransportId::new("tcp");
        txn.add_transport(&t).unwrap();
        let c = txn.add_contact("alice").unwrap();

        // Adding the contact after the transport also seeds a version row.
        let due = txn.get_transport_updates(c).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].version, 1);

        txn.set_transport_update_acked(c, &t, 1).unwrap();
        assert!(txn.get_transport_updates(c).unwrap().is_empty());

        // An unchanged merge does not bump the version.
        txn.merge_local_properties(&t, &props(&[])).unwrap();
        assert!(txn.get_transport_updates(c).unwrap().is_empty());

        txn.merge_local_properties(&t, &props(&[("port", "7000")]))
            .unwrap();
        let due = txn.get_transport_updates(c).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].version, 2);
        assert_eq!(due[0].properties, props(&[("port", "7000")]));
    }

    #[test]
    fn remote_properties_are_version_gated() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();
        // The contact's transport, which we do not run ourselves.
        let t = TransportId::new("tor");

        assert!(txn
            .set_remote_properties(c, &t, &props(&[("onion", "abc")]), 5)
            .unwrap());
        assert!(!txn
            .set_remote_properties(c, &t, &props(&[("onion", "old")]), 3)
            .unwrap());
        let all = txn.get_remote_properties(&t).unwrap();
        assert_eq!(all.get(&c), Some(&props(&[("onion", "abc")])));

        let acks = txn.get_transport_acks(c).unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].version, 5);
        assert!(txn.get_transport_acks(c).unwrap().is_empty());
    }

    #[test]
    fn adding_transport_seeds_versions_for_existing_contacts() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();
        let t = TransportId::new("bt");
        txn.add_transport(&t).unwrap();

        let due = txn.get_transport_updates(c).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].transport, t);
    }
}
