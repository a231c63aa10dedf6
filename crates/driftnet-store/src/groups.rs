//! Subscriptions, visibility and the subscription side of the versioned
//! exchange.
//!
//! Version semantics (shared with retention and transports): local changes
//! bump `localVersion`; an update is due while `localVersion > localAcked`;
//! an inbound update is applied only if its version is newer than
//! `remoteVersion` and flips `remoteAcked` to false; an inbound ack moves
//! `localAcked` forward only within `(localAcked, localVersion]`.

use rusqlite::{params, OptionalExtension};

use driftnet_shared::constants::MAX_SUBSCRIPTIONS;
use driftnet_shared::protocol::{SubscriptionAck, SubscriptionUpdate};
use driftnet_shared::{ContactId, Group, GroupId};

use crate::database::Txn;
use crate::error::{Result, StoreError};

impl Txn<'_> {
    /// Subscribe to a group.  Returns false if the group is already a
    /// subscription or the subscription limit is reached.
    pub fn add_subscription(&self, g: &Group) -> Result<bool> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        if count as usize >= MAX_SUBSCRIPTIONS {
            return Ok(false);
        }
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO groups (groupId, name, publicKey) VALUES (?1, ?2, ?3)",
            params![g.id.to_hex(), g.name, g.public_key],
        )?;
        Ok(affected == 1)
    }

    /// Return true if the group is a current subscription.
    pub fn contains_subscription(&self, g: GroupId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM groups WHERE groupId = ?1",
            params![g.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a subscribed group.
    pub fn get_group(&self, g: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT groupId, name, publicKey FROM groups WHERE groupId = ?1",
                params![g.to_hex()],
                row_to_group,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all subscribed groups.
    pub fn get_subscriptions(&self) -> Result<Vec<Group>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT groupId, name, publicKey FROM groups ORDER BY name")?;
        let rows = stmt.query_map([], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Unsubscribe from a group.  The group's messages and visibility rows
    /// cascade.
    pub fn remove_subscription(&self, g: GroupId) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE groupId = ?1", params![g.to_hex()])?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Make the group visible to the contact and bump the contact's
    /// subscription version so an update becomes due.
    pub fn add_visibility(&self, c: ContactId, g: GroupId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO groupVisibilities (contactId, groupId) VALUES (?1, ?2)",
            params![c.0, g.to_hex()],
        )?;
        self.bump_subscription_version(c)
    }

    /// Make the group invisible to the contact and bump the contact's
    /// subscription version.
    pub fn remove_visibility(&self, c: ContactId, g: GroupId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM groupVisibilities WHERE contactId = ?1 AND groupId = ?2",
            params![c.0, g.to_hex()],
        )?;
        self.bump_subscription_version(c)
    }

    fn bump_subscription_version(&self, c: ContactId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE groupVersions SET localVersion = localVersion + 1
             WHERE contactId = ?1",
            params![c.0],
        )?;
        if affected != 1 {
            return Err(StoreError::Corrupt(format!(
                "no groupVersions row for contact {}",
                c
            )));
        }
        Ok(())
    }

    /// Contacts the group is visible to.
    pub fn get_visibility(&self, g: GroupId) -> Result<Vec<ContactId>> {
        let mut stmt = self.conn().prepare(
            "SELECT contactId FROM groupVisibilities WHERE groupId = ?1 ORDER BY contactId",
        )?;
        let rows = stmt.query_map(params![g.to_hex()], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ContactId(row?));
        }
        Ok(ids)
    }

    /// Subscribed groups visible to the contact.
    pub fn get_visible_subscriptions(&self, c: ContactId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.groupId, g.name, g.publicKey FROM groups AS g
             JOIN groupVisibilities AS gv ON g.groupId = gv.groupId
             WHERE gv.contactId = ?1
             ORDER BY g.name",
        )?;
        let rows = stmt.query_map(params![c.0], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// True if the group is a subscription and visible to the contact.
    pub fn contains_visible_subscription(&self, c: ContactId, g: GroupId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM groups AS g
             JOIN groupVisibilities AS gv ON g.groupId = gv.groupId
             WHERE gv.contactId = ?1 AND g.groupId = ?2",
            params![c.0, g.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Groups the contact has told us it subscribes to.
    pub fn get_remote_subscriptions(&self, c: ContactId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT groupId, name, publicKey FROM contactGroups
             WHERE contactId = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![c.0], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Replace the contact's remote subscriptions, unless an update with
    /// an equal or higher version has already been applied.  Returns true
    /// if the update was applied.  A repeat of the current version is not
    /// re-applied but still re-arms the ack, covering a lost ack.
    pub fn set_remote_subscriptions(
        &self,
        c: ContactId,
        groups: &[Group],
        version: u64,
    ) -> Result<bool> {
        self.conn().execute(
            "UPDATE groupVersions SET remoteAcked = 0
             WHERE contactId = ?2 AND remoteVersion <= ?1",
            params![version as i64, c.0],
        )?;
        let affected = self.conn().execute(
            "UPDATE groupVersions SET remoteVersion = ?1
             WHERE contactId = ?2 AND remoteVersion < ?1",
            params![version as i64, c.0],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        self.conn().execute(
            "DELETE FROM contactGroups WHERE contactId = ?1",
            params![c.0],
        )?;
        let mut stmt = self.conn().prepare(
            "INSERT INTO contactGroups (contactId, groupId, name, publicKey)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for g in groups {
            stmt.execute(params![c.0, g.id.to_hex(), g.name, g.public_key])?;
        }
        Ok(true)
    }

    /// Return a subscription ack for the contact, or `None` if none is
    /// due.  Returning the ack records it as sent.
    pub fn get_subscription_ack(&self, c: ContactId) -> Result<Option<SubscriptionAck>> {
        let version: Option<i64> = self
            .conn()
            .query_row(
                "SELECT remoteVersion FROM groupVersions
                 WHERE contactId = ?1 AND remoteAcked = 0",
                params![c.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Ok(None);
        };
        self.conn().execute(
            "UPDATE groupVersions SET remoteAcked = 1 WHERE contactId = ?1",
            params![c.0],
        )?;
        Ok(Some(SubscriptionAck {
            version: version as u64,
        }))
    }

    /// Return a subscription update for the contact, or `None` if none is
    /// due (`localVersion <= localAcked`).
    pub fn get_subscription_update(&self, c: ContactId) -> Result<Option<SubscriptionUpdate>> {
        let version: Option<i64> = self
            .conn()
            .query_row(
                "SELECT localVersion FROM groupVersions
                 WHERE contactId = ?1 AND localVersion > localAcked",
                params![c.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Ok(None);
        };
        let groups = self.get_visible_subscriptions(c)?;
        Ok(Some(SubscriptionUpdate {
            groups,
            version: version as u64,
        }))
    }

    /// Record a subscription ack from the contact, unless it acks a
    /// version outside `(localAcked, localVersion]`.
    pub fn set_subscription_update_acked(&self, c: ContactId, version: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE groupVersions SET localAcked = ?1
             WHERE contactId = ?2 AND localAcked < ?1 AND localVersion >= ?1",
            params![version as i64, c.0],
        )?;
        Ok(())
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let public_key: Option<Vec<u8>> = row.get(2)?;

    Ok(Group {
        id: GroupId(crate::messages::decode_id_sql(0, &id_str)?),
        name,
        public_key,
    })
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    use super::*;

    #[test]
    fn subscribe_and_visibility_round_trip() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();
        let g = Group::new("news", None);

        assert!(txn.add_subscription(&g).unwrap());
        assert!(!txn.add_subscription(&g).unwrap());
        assert!(txn.contains_subscription(g.id).unwrap());
        assert!(!txn.contains_visible_subscription(c, g.id).unwrap());

        txn.add_visibility(c, g.id).unwrap();
        assert!(txn.contains_visible_subscription(c, g.id).unwrap());
        assert_eq!(txn.get_visibility(g.id).unwrap(), vec![c]);
        assert_eq!(txn.get_visible_subscriptions(c).unwrap(), vec![g.clone()]);

        txn.remove_visibility(c, g.id).unwrap();
        assert!(!txn.contains_visible_subscription(c, g.id).unwrap());
    }

    #[test]
    fn remote_subscriptions_are_version_gated() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();
        let g1 = Group::new("one", None);
        let g2 = Group::new("two", None);

        assert!(txn
            .set_remote_subscriptions(c, &[g1.clone()], 5)
            .unwrap());
        // An older version is ignored.
        assert!(!txn
            .set_remote_subscriptions(c, &[g2.clone()], 3)
            .unwrap());
        assert_eq!(txn.get_remote_subscriptions(c).unwrap(), vec![g1]);
        // A newer one replaces the state.
        assert!(txn
            .set_remote_subscriptions(c, &[g2.clone()], 7)
            .unwrap());
        assert_eq!(txn.get_remote_subscriptions(c).unwrap(), vec![g2]);
    }

    #[test]
    fn subscription_ack_is_recorded_once() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();

        txn.set_remote_subscriptions(c, &[], 5).unwrap();
        let ack = txn.get_subscription_ack(c).unwrap().unwrap();
        assert_eq!(ack.version, 5);
        assert!(txn.get_subscription_ack(c).unwrap().is_none());

        // A repeated update means the ack was lost: ack it again.
        assert!(!txn.set_remote_subscriptions(c, &[], 5).unwrap());
        let ack = txn.get_subscription_ack(c).unwrap().unwrap();
        assert_eq!(ack.version, 5);
    }

    #[test]
    fn subscription_update_due_until_acked() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        let c = txn.add_contact("alice").unwrap();

        let update = txn.get_subscription_update(c).unwrap().unwrap();
        assert_eq!(update.version, 1);

        txn.set_subscription_update_acked(c, 1).unwrap();
        assert!(txn.get_subscription_update(c).unwrap().is_none());

        // An ack for a version never sent moves nothing.
        txn.set_subscription_update_acked(c, 9).unwrap();
        assert!(txn.get_subscription_update(c).unwrap().is_none());

        let g = Group::new("news", None);
        txn.add_subscription(&g).unwrap();
        txn.add_visibility(c, g.id).unwrap();
        let update = txn.get_subscription_update(c).unwrap().unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.groups, vec![g]);
    }

    #[test]
    fn truncated_group_id_is_reported_not_zero_filled() {
        let mut db = Database::open_in_memory(1024).unwrap();
        let txn = db.transaction().unwrap();
        txn.conn()
            .execute(
                "INSERT INTO groups (groupId, name) VALUES ('abcd', 'bad')",
                [],
            )
            .unwrap();
        assert!(txn.get_subscriptions().is_err());
    }
}
