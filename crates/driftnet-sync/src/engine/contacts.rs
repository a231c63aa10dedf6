//! Contact lifecycle operations.

use driftnet_shared::{Contact, ContactId};

use crate::error::Result;
use crate::event::Event;
use crate::locks::{LockDomain as D, LockMode as M};

use super::{map_not_found, SyncEngine};

impl SyncEngine {
    /// Add a contact, seeding its versioned exchange state.
    pub fn add_contact(&self, name: &str) -> Result<ContactId> {
        let id = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Write)]);
            self.with_txn(|txn| Ok(txn.add_contact(name)?))?
        };
        tracing::info!(contact = %id, name, "contact added");
        self.events.emit(&Event::ContactAdded(id));
        Ok(id)
    }

    /// Remove a contact.  Everything the contact owns (statuses, pending
    /// acks, visibility rows, version tuples, contact transports, secrets)
    /// goes with it.
    pub fn remove_contact(&self, c: ContactId) -> Result<()> {
        {
            let _scope = self.locks.acquire(&[
                (D::Contact, M::Write),
                (D::Message, M::Write),
                (D::Retention, M::Write),
                (D::Subscription, M::Write),
                (D::Transport, M::Write),
                (D::Window, M::Write),
            ]);
            self.with_txn(|txn| {
                map_not_found(txn.remove_contact(c), || {
                    crate::error::DbError::NoSuchContact(c)
                })
            })?;
        }
        tracing::info!(contact = %c, "contact removed");
        self.events.emit(&Event::ContactRemoved(c));
        Ok(())
    }

    pub fn get_contact(&self, c: ContactId) -> Result<Contact> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read)]);
        self.with_txn(|txn| {
            map_not_found(txn.get_contact(c), || {
                crate::error::DbError::NoSuchContact(c)
            })
        })
    }

    pub fn get_contacts(&self) -> Result<Vec<Contact>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_contacts()?))
    }

    pub fn get_contact_ids(&self) -> Result<Vec<ContactId>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_contact_ids()?))
    }

    /// Record that a connection to the contact was made just now.
    pub fn record_connection(&self, c: ContactId) -> Result<()> {
        let now = self.clock.now_ms();
        let _scope = self.locks.acquire(&[(D::Contact, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.set_last_connected(c, now)?)
        })
    }
}
