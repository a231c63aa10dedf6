//! Generating and consuming sync protocol payloads.
//!
//! Anti-entropy runs per contact: acks for received messages, offers of
//! sendable messages, requests answering offers, batches of raw messages,
//! and the versioned exchange of subscriptions, retention times and
//! transport properties.  Payload generation and receipt are both
//! idempotent: a lost or duplicated payload is never more than wasted
//! bandwidth.

use driftnet_shared::constants::MAX_SUBSCRIPTIONS;
use driftnet_shared::protocol::{
    Ack, Batch, Offer, Request, RetentionAck, RetentionUpdate, SubscriptionAck,
    SubscriptionUpdate, TransportAck, TransportUpdate,
};
use driftnet_shared::{ContactId, Message, MessageId};

use crate::error::{DbError, Result};
use crate::event::Event;
use crate::locks::{LockDomain as D, LockMode as M};

use super::SyncEngine;

impl SyncEngine {
    // -----------------------------------------------------------------
    // Acks
    // -----------------------------------------------------------------

    /// Generate an ack for messages received from the contact, or `None`
    /// if nothing is pending.  Two phases: the pending ids are read under
    /// the message read lock, then deleted under the write lock.
    pub fn generate_ack(&self, c: ContactId) -> Result<Option<Ack>> {
        let ids = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Message, M::Read)]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                Ok(txn.get_messages_to_ack(c, self.config.max_messages_per_ack)?)
            })?
        };
        if ids.is_empty() {
            return Ok(None);
        }
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Message, M::Write)]);
        self.with_txn(|txn| Ok(txn.remove_messages_to_ack(c, &ids)?))?;
        Ok(Some(Ack { message_ids: ids }))
    }

    /// Apply an ack from the contact: `Sent -> Seen` only.  Acks for
    /// unknown or never-sent messages are ignored.
    pub fn receive_ack(&self, c: ContactId, ack: &Ack) -> Result<()> {
        if ack.message_ids.len() > self.config.max_messages_per_ack {
            return Err(DbError::Protocol(format!(
                "ack with {} ids",
                ack.message_ids.len()
            )));
        }
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Message, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            for id in &ack.message_ids {
                txn.set_status_seen_if_sent(c, *id)?;
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Offers and requests
    // -----------------------------------------------------------------

    /// Generate an offer of currently sendable messages, oldest first, or
    /// `None` if nothing is sendable.
    pub fn generate_offer(&self, c: ContactId) -> Result<Option<Offer>> {
        let _scope = self.locks.acquire(&[
            (D::Contact, M::Read),
            (D::Message, M::Read),
            (D::Retention, M::Read),
            (D::Subscription, M::Read),
        ]);
        let ids = self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_messages_to_offer(c, self.config.max_messages_per_offer)?)
        })?;
        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(Offer { message_ids: ids }))
    }

    /// Answer an offer from the contact: one request bit per offered id,
    /// set if we do not hold the message in a form visible to the contact.
    /// Ids we hold visibly are marked seen instead.
    pub fn receive_offer(&self, c: ContactId, offer: &Offer) -> Result<Request> {
        if offer.message_ids.len() > self.config.max_messages_per_offer {
            return Err(DbError::Protocol(format!(
                "offer with {} ids",
                offer.message_ids.len()
            )));
        }
        let _scope = self.locks.acquire(&[
            (D::Contact, M::Read),
            (D::Message, M::Write),
            (D::Subscription, M::Read),
        ]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            let mut request = Request::new(offer.message_ids.len());
            for (i, id) in offer.message_ids.iter().enumerate() {
                if !txn.set_status_seen_if_visible(c, *id)? {
                    request.set(i);
                }
            }
            Ok(request)
        })
    }

    // -----------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------

    /// Generate a batch of sendable messages, oldest first, with body
    /// lengths summing to at most `max_bytes`.  With `requested`, only
    /// those ids are considered, in the order given.  Included messages
    /// are marked `Sent`; `None` if nothing qualifies.
    pub fn generate_batch(
        &self,
        c: ContactId,
        max_bytes: usize,
        requested: Option<&[MessageId]>,
    ) -> Result<Option<Batch>> {
        let _scope = self.locks.acquire(&[
            (D::Contact, M::Read),
            (D::Message, M::Write),
            (D::Retention, M::Read),
            (D::Subscription, M::Read),
        ]);
        let batch = self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            let mut ids = Vec::new();
            let mut raws = Vec::new();
            let mut total = 0usize;
            match requested {
                Some(wanted) => {
                    for id in wanted {
                        let Some(m) = txn.get_message_if_sendable(c, *id)? else {
                            continue;
                        };
                        if total + m.length() > max_bytes {
                            break;
                        }
                        total += m.length();
                        raws.push(bincode::serialize(&m)?);
                        ids.push(*id);
                    }
                }
                None => {
                    for id in txn.get_sendable_messages(c, max_bytes)? {
                        let m = txn.get_message(id)?;
                        raws.push(bincode::serialize(&m)?);
                        ids.push(id);
                    }
                }
            }
            if ids.is_empty() {
                return Ok(None);
            }
            txn.set_statuses_sent(c, &ids)?;
            Ok(Some(Batch { messages: raws }))
        })?;
        if let Some(batch) = &batch {
            tracing::debug!(contact = %c, messages = batch.messages.len(), "batch generated");
        }
        Ok(batch)
    }

    /// Store a batch of messages from the contact.  Messages whose id does
    /// not match their content are dropped; the rest go through the same
    /// path as [`SyncEngine::receive_message`].
    pub fn receive_batch(&self, c: ContactId, batch: &Batch) -> Result<()> {
        self.wait_for_permission_to_write();
        let (events, stored_bytes, received) = {
            let _scope = self.locks.acquire(&[
                (D::Contact, M::Read),
                (D::Message, M::Write),
                (D::Rating, M::Read),
                (D::Subscription, M::Read),
            ]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                let mut events = Vec::new();
                let mut stored_bytes = 0u64;
                let mut received = false;
                for raw in &batch.messages {
                    let m: Message = bincode::deserialize(raw)?;
                    let expected =
                        Message::new(m.parent, m.group, m.author, m.timestamp, m.body.clone());
                    if expected.id != m.id {
                        tracing::warn!(contact = %c, message = %m.id, "dropping message with forged id");
                        continue;
                    }
                    let (counted, event) = self.receive_message_txn(txn, c, &m)?;
                    received |= counted;
                    if let Some(event) = event {
                        stored_bytes += m.length() as u64;
                        events.push(event);
                    }
                }
                Ok((events, stored_bytes, received))
            })?
        };
        self.record_stored_bytes(stored_bytes);
        for event in &events {
            self.events.emit(event);
        }
        if received {
            self.events.emit(&Event::MessageReceived { contact: c });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Subscription exchange
    // -----------------------------------------------------------------

    /// Generate an ack for the contact's latest subscription update, or
    /// `None` if it is already acked.
    pub fn generate_subscription_ack(&self, c: ContactId) -> Result<Option<SubscriptionAck>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Subscription, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_subscription_ack(c)?)
        })
    }

    /// Generate a subscription update for the contact, or `None` while the
    /// current version is acked.  Generation does not advance the acked
    /// version; only an ack does, so updates repeat until one arrives.
    pub fn generate_subscription_update(&self, c: ContactId) -> Result<Option<SubscriptionUpdate>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Subscription, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_subscription_update(c)?)
        })
    }

    /// Apply a subscription update from the contact, ignoring stale
    /// versions.
    pub fn receive_subscription_update(
        &self,
        c: ContactId,
        update: &SubscriptionUpdate,
    ) -> Result<()> {
        if update.groups.len() > MAX_SUBSCRIPTIONS {
            return Err(DbError::Protocol(format!(
                "subscription update with {} groups",
                update.groups.len()
            )));
        }
        let applied = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Subscription, M::Write)]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                Ok(txn.set_remote_subscriptions(c, &update.groups, update.version)?)
            })?
        };
        if applied {
            self.events.emit(&Event::RemoteSubscriptionsUpdated(c));
        }
        Ok(())
    }

    pub fn receive_subscription_ack(&self, c: ContactId, ack: &SubscriptionAck) -> Result<()> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Subscription, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.set_subscription_update_acked(c, ack.version)?)
        })
    }

    // -----------------------------------------------------------------
    // Retention exchange
    // -----------------------------------------------------------------

    pub fn generate_retention_ack(&self, c: ContactId) -> Result<Option<RetentionAck>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Retention, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_retention_ack(c)?)
        })
    }

    pub fn generate_retention_update(&self, c: ContactId) -> Result<Option<RetentionUpdate>> {
        let _scope =
            self.locks
                .acquire(&[(D::Contact, M::Read), (D::Message, M::Read), (D::Retention, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_retention_update(c)?)
        })
    }

    /// Apply a retention update from the contact, ignoring stale versions.
    pub fn receive_retention_update(&self, c: ContactId, update: &RetentionUpdate) -> Result<()> {
        let applied = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Retention, M::Write)]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                Ok(txn.set_retention_time(c, update.retention, update.version)?)
            })?
        };
        if applied {
            self.events.emit(&Event::RemoteRetentionUpdated(c));
        }
        Ok(())
    }

    pub fn receive_retention_ack(&self, c: ContactId, ack: &RetentionAck) -> Result<()> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Retention, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.set_retention_update_acked(c, ack.version)?)
        })
    }

    // -----------------------------------------------------------------
    // Transport exchange
    // -----------------------------------------------------------------

    /// Acks for the contact's unacked transport updates, one per
    /// transport.
    pub fn generate_transport_acks(&self, c: ContactId) -> Result<Vec<TransportAck>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Transport, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_transport_acks(c)?)
        })
    }

    /// Transport updates due to the contact, one per local transport with
    /// unacked property changes.
    pub fn generate_transport_updates(&self, c: ContactId) -> Result<Vec<TransportUpdate>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Transport, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_transport_updates(c)?)
        })
    }

    /// Apply a transport update from the contact, ignoring stale versions.
    pub fn receive_transport_update(&self, c: ContactId, update: &TransportUpdate) -> Result<()> {
        let applied = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Transport, M::Write)]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                Ok(txn.set_remote_properties(
                    c,
                    &update.transport,
                    &update.properties,
                    update.version,
                )?)
            })?
        };
        if applied {
            self.events.emit(&Event::RemoteTransportsUpdated {
                contact: c,
                transport: update.transport.clone(),
            });
        }
        Ok(())
    }

    pub fn receive_transport_ack(&self, c: ContactId, ack: &TransportAck) -> Result<()> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Transport, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.set_transport_update_acked(c, &ack.transport, ack.version)?)
        })
    }
}
