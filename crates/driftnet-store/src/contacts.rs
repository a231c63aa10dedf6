//! CRUD operations for contacts.
//!
//! Adding a contact also seeds its versioned exchange rows (subscriptions,
//! retention, one per local transport) so updates become due immediately.

use rusqlite::params;

use driftnet_shared::{Contact, ContactId};

use crate::database::Txn;
use crate::error::{Result, StoreError};

impl Txn<'_> {
    /// Insert a new contact and seed its versioned exchange state.
    pub fn add_contact(&self, name: &str) -> Result<ContactId> {
        self.conn().execute(
            "INSERT INTO contacts (name, lastConnected) VALUES (?1, 0)",
            params![name],
        )?;
        let id = ContactId(self.conn().last_insert_rowid());

        // Local versions start at 1 and acked at 0, so a subscription
        // update and a retention update are due as soon as the contact
        // exists.
        self.conn().execute(
            "INSERT INTO groupVersions
             (contactId, localVersion, localAcked, remoteVersion, remoteAcked)
             VALUES (?1, 1, 0, 0, 1)",
            params![id.0],
        )?;
        self.conn().execute(
            "INSERT INTO retentionVersions
             (contactId, retention, localVersion, localAcked, remoteVersion, remoteAcked)
             VALUES (?1, 0, 1, 0, 0, 1)",
            params![id.0],
        )?;
        self.conn().execute(
            "INSERT INTO transportVersions (contactId, transportId, localVersion, localAcked)
             SELECT ?1, transportId, 1, 0 FROM transports",
            params![id.0],
        )?;

        Ok(id)
    }

    /// Return true if the contact exists.
    pub fn contains_contact(&self, c: ContactId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM contacts WHERE contactId = ?1",
            params![c.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a single contact.
    pub fn get_contact(&self, c: ContactId) -> Result<Contact> {
        self.conn()
            .query_row(
                "SELECT contactId, name, lastConnected FROM contacts
                 WHERE contactId = ?1",
                params![c.0],
                row_to_contact,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all contacts.
    pub fn get_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT contactId, name, lastConnected FROM contacts ORDER BY contactId",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// List the ids of all contacts.
    pub fn get_contact_ids(&self) -> Result<Vec<ContactId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT contactId FROM contacts ORDER BY contactId")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ContactId(row?));
        }
        Ok(ids)
    }

    /// Delete a contact.  All owned rows (statuses, pending acks, secrets,
    /// contact transports, visibility and version rows) cascade.
    pub fn remove_contact(&self, c: ContactId) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE contactId = ?1", params![c.0])?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record the time a connection to the contact was last made.
    pub fn set_last_connected(&self, c: ContactId, now: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE contacts SET lastConnected = ?1 WHERE contactId = ?2",
            params![now, c.0],
        )?;
        Ok(())
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: ContactId(row.get(0)?),
        name: row.get(1)?,
        last_connected: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    use super::*;

    #[test]
    fn add_get_remove_contact() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();

        let id = txn.add_contact("alice").unwrap();
        assert!(txn.contains_contact(id).unwrap());
        let contact = txn.get_contact(id).unwrap();
        assert_eq!(contact.name, "alice");
        assert_eq!(contact.last_connected, 0);

        txn.remove_contact(id).unwrap();
        assert!(!txn.contains_contact(id).unwrap());
        assert!(matches!(txn.get_contact(id), Err(StoreError::NotFound)));
    }

    #[test]
    fn adding_contact_seeds_version_rows() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let id = txn.add_contact("bob").unwrap();

        // A subscription update and a retention update are due at once.
        assert!(txn.get_subscription_update(id).unwrap().is_some());
        assert!(txn.get_retention_update(id).unwrap().is_some());
    }
}
