//! Subscription and visibility management.

use driftnet_shared::{ContactId, Group, GroupId};

use crate::error::{DbError, Result};
use crate::event::Event;
use crate::locks::{LockDomain as D, LockMode as M};

use super::SyncEngine;

impl SyncEngine {
    /// Subscribe to a group.  Returns false if already subscribed or the
    /// subscription limit is reached.
    pub fn subscribe(&self, g: &Group) -> Result<bool> {
        let added = {
            let _scope = self.locks.acquire(&[(D::Subscription, M::Write)]);
            self.with_txn(|txn| Ok(txn.add_subscription(g)?))?
        };
        if added {
            tracing::info!(group = %g.id, name = %g.name, "subscribed");
            self.events.emit(&Event::SubscriptionAdded(g.id));
        }
        Ok(added)
    }

    /// Unsubscribe from a group, deleting its messages and revoking its
    /// visibility.  Contacts that could see the group get a subscription
    /// version bump so they learn of the change.
    pub fn unsubscribe(&self, g: GroupId) -> Result<()> {
        let affected = {
            let _scope = self.locks.acquire(&[(D::Message, M::Write), (D::Subscription, M::Write)]);
            self.with_txn(|txn| {
                if !txn.contains_subscription(g)? {
                    return Err(DbError::NoSuchGroup(g));
                }
                let affected = txn.get_visibility(g)?;
                for c in &affected {
                    txn.remove_visibility(*c, g)?;
                }
                txn.remove_subscription(g)?;
                Ok(affected)
            })?
        };
        tracing::info!(group = %g, "unsubscribed");
        self.events.emit(&Event::SubscriptionRemoved(g));
        if !affected.is_empty() {
            self.events
                .emit(&Event::LocalSubscriptionsUpdated { affected });
        }
        Ok(())
    }

    pub fn get_subscriptions(&self) -> Result<Vec<Group>> {
        let _scope = self.locks.acquire(&[(D::Subscription, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_subscriptions()?))
    }

    /// Make the group visible to exactly `contacts`.  Only the contacts
    /// whose visibility actually changes get a version bump.
    pub fn set_visibility(&self, g: GroupId, contacts: &[ContactId]) -> Result<()> {
        let changed = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Subscription, M::Write)]);
            self.with_txn(|txn| {
                if !txn.contains_subscription(g)? {
                    return Err(DbError::NoSuchGroup(g));
                }
                for c in contacts {
                    self.ensure_contact(txn, *c)?;
                }
                let current = txn.get_visibility(g)?;
                let mut changed = Vec::new();
                for c in contacts {
                    if !current.contains(c) {
                        txn.add_visibility(*c, g)?;
                        changed.push(*c);
                    }
                }
                for c in current {
                    if !contacts.contains(&c) {
                        txn.remove_visibility(c, g)?;
                        changed.push(c);
                    }
                }
                Ok(changed)
            })?
        };
        if !changed.is_empty() {
            self.events.emit(&Event::LocalSubscriptionsUpdated {
                affected: changed,
            });
        }
        Ok(())
    }

    /// Contacts the group is currently visible to.
    pub fn get_visibility(&self, g: GroupId) -> Result<Vec<ContactId>> {
        let _scope = self.locks.acquire(&[(D::Subscription, M::Read)]);
        self.with_txn(|txn| {
            if !txn.contains_subscription(g)? {
                return Err(DbError::NoSuchGroup(g));
            }
            Ok(txn.get_visibility(g)?)
        })
    }
}
