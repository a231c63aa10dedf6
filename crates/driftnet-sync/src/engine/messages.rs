//! Storing messages, delivery bookkeeping and the sendability counters.
//!
//! A group message's sendability is `(author rated Good ? 1 : 0)` plus the
//! number of its children in the same group with positive sendability.
//! The counter is maintained incrementally: whenever a message crosses the
//! `0 <-> >0` boundary, its ancestors are walked iteratively and adjusted,
//! stopping at the first ancestor that does not cross, at a missing
//! parent, or at a parent in a different group.

use std::collections::BTreeMap;

use driftnet_shared::constants::MAX_MESSAGE_LENGTH;
use driftnet_shared::{AuthorId, ContactId, GroupId, Message, MessageId, Rating, Status};

use driftnet_store::{MessageHeader, Txn};

use crate::error::{DbError, Result};
use crate::event::Event;
use crate::locks::{LockDomain as D, LockMode as M};

use super::{map_not_found, SyncEngine};

impl SyncEngine {
    /// Store a locally composed group message.  The group must be a
    /// current subscription.  Duplicates are ignored.
    pub fn store_local_group_message(&self, m: Message) -> Result<MessageId> {
        self.wait_for_permission_to_write();
        let group = m.group.ok_or_else(|| {
            DbError::Protocol("group message without a group".into())
        })?;
        let stored = {
            let _scope = self.locks.acquire(&[
                (D::Contact, M::Read),
                (D::Message, M::Write),
                (D::Rating, M::Read),
                (D::Subscription, M::Read),
            ]);
            self.with_txn(|txn| {
                if !txn.contains_subscription(group)? {
                    return Err(DbError::NoSuchGroup(group));
                }
                if txn.contains_message(m.id)? {
                    return Ok(false);
                }
                txn.add_group_message(&m, false)?;
                txn.set_read_flag(m.id, true)?;
                for c in txn.get_visibility(group)? {
                    txn.set_status(c, m.id, Status::New)?;
                }
                let sendability = calculate_sendability(txn, &m)?;
                if sendability > 0 {
                    txn.set_sendability(m.id, sendability)?;
                    update_ancestor_sendability(txn, m.id, true)?;
                }
                Ok(true)
            })?
        };
        if stored {
            self.record_stored_bytes(m.length() as u64);
            self.events.emit(&Event::GroupMessageAdded {
                group,
                incoming: false,
            });
        }
        Ok(m.id)
    }

    /// Store a locally composed private message to the contact.
    pub fn store_local_private_message(&self, m: Message, c: ContactId) -> Result<MessageId> {
        self.wait_for_permission_to_write();
        let stored = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Message, M::Write)]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                if txn.contains_message(m.id)? {
                    return Ok(false);
                }
                txn.add_private_message(&m, c, false)?;
                txn.set_read_flag(m.id, true)?;
                txn.set_status(c, m.id, Status::New)?;
                Ok(true)
            })?
        };
        if stored {
            self.record_stored_bytes(m.length() as u64);
            self.events.emit(&Event::PrivateMessageAdded {
                contact: c,
                incoming: false,
            });
        }
        Ok(m.id)
    }

    /// Store a message received from the contact.  Invalid messages are
    /// dropped; everything else is queued for acknowledgement even when it
    /// is a duplicate or belongs to a group the contact cannot see, so the
    /// contact stops resending it.
    pub fn receive_message(&self, c: ContactId, m: Message) -> Result<()> {
        self.wait_for_permission_to_write();
        let (received, event) = {
            let _scope = self.locks.acquire(&[
                (D::Contact, M::Read),
                (D::Message, M::Write),
                (D::Rating, M::Read),
                (D::Subscription, M::Read),
            ]);
            self.with_txn(|txn| {
                self.ensure_contact(txn, c)?;
                self.receive_message_txn(txn, c, &m)
            })?
        };
        if let Some(event) = &event {
            self.record_stored_bytes(m.length() as u64);
            self.events.emit(event);
        }
        if received {
            self.events.emit(&Event::MessageReceived { contact: c });
        }
        Ok(())
    }

    /// Transaction body of [`receive_message`], shared with batch receipt.
    /// Returns whether the message counted as received (it was queued for
    /// acknowledgement) and the event to fire after commit if it was
    /// stored.
    pub(super) fn receive_message_txn(
        &self,
        txn: &Txn<'_>,
        c: ContactId,
        m: &Message,
    ) -> Result<(bool, Option<Event>)> {
        if m.length() > MAX_MESSAGE_LENGTH {
            tracing::warn!(contact = %c, message = %m.id, length = m.length(), "dropping oversized message");
            return Ok((false, None));
        }
        if m.timestamp > self.clock.now_ms() {
            tracing::debug!(contact = %c, message = %m.id, "dropping message from the future");
            return Ok((false, None));
        }
        if txn.contains_message(m.id)? {
            // The sender evidently has it.
            txn.set_status_seen_if_visible(c, m.id)?;
            txn.add_message_to_ack(c, m.id)?;
            return Ok((true, None));
        }
        let Some(group) = m.group else {
            txn.add_private_message(m, c, true)?;
            txn.set_status(c, m.id, Status::Seen)?;
            txn.add_message_to_ack(c, m.id)?;
            return Ok((
                true,
                Some(Event::PrivateMessageAdded {
                    contact: c,
                    incoming: true,
                }),
            ));
        };
        if !txn.contains_visible_subscription(c, group)? {
            // Not storable, but ack it so the contact stops offering it.
            tracing::debug!(contact = %c, message = %m.id, group = %group, "dropping message for an invisible group");
            txn.add_message_to_ack(c, m.id)?;
            return Ok((true, None));
        }
        txn.add_group_message(m, true)?;
        txn.set_status(c, m.id, Status::Seen)?;
        for other in txn.get_visibility(group)? {
            if other != c {
                txn.set_status(other, m.id, Status::New)?;
            }
        }
        let sendability = calculate_sendability(txn, m)?;
        if sendability > 0 {
            txn.set_sendability(m.id, sendability)?;
            update_ancestor_sendability(txn, m.id, true)?;
        }
        txn.add_message_to_ack(c, m.id)?;
        Ok((
            true,
            Some(Event::GroupMessageAdded {
                group,
                incoming: true,
            }),
        ))
    }

    /// Rate an author, re-scoring every stored message of theirs when the
    /// rating crosses into or out of `Good`.  Returns the previous rating.
    pub fn set_rating(&self, a: AuthorId, rating: Rating) -> Result<Rating> {
        let old = {
            let _scope = self.locks.acquire(&[(D::Message, M::Write), (D::Rating, M::Write)]);
            self.with_txn(|txn| {
                let old = txn.set_rating(a, rating)?;
                let was_good = old == Rating::Good;
                let is_good = rating == Rating::Good;
                if was_good != is_good {
                    for id in txn.get_messages_by_author(a)? {
                        let before = txn.get_sendability(id)?;
                        let after = if is_good { before + 1 } else { before - 1 };
                        txn.set_sendability(id, after)?;
                        let crossed = if is_good { before == 0 } else { after == 0 };
                        if crossed {
                            update_ancestor_sendability(txn, id, is_good)?;
                        }
                    }
                }
                Ok(old)
            })?
        };
        if old != rating {
            self.events.emit(&Event::RatingChanged { author: a, rating });
        }
        Ok(old)
    }

    pub fn get_rating(&self, a: AuthorId) -> Result<Rating> {
        let _scope = self.locks.acquire(&[(D::Rating, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_rating(a)?))
    }

    // -----------------------------------------------------------------
    // Reading and read flags
    // -----------------------------------------------------------------

    pub fn get_message(&self, m: MessageId) -> Result<Message> {
        let _scope = self.locks.acquire(&[(D::Message, M::Read)]);
        self.with_txn(|txn| map_not_found(txn.get_message(m), || DbError::NoSuchMessage(m)))
    }

    pub fn get_group_message_headers(&self, g: GroupId) -> Result<Vec<MessageHeader>> {
        let _scope = self.locks.acquire(&[(D::Message, M::Read), (D::Subscription, M::Read)]);
        self.with_txn(|txn| {
            if !txn.contains_subscription(g)? {
                return Err(DbError::NoSuchGroup(g));
            }
            Ok(txn.get_group_message_headers(g)?)
        })
    }

    pub fn get_private_message_headers(&self, c: ContactId) -> Result<Vec<MessageHeader>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Message, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            Ok(txn.get_private_message_headers(c)?)
        })
    }

    /// Set a message's read flag, returning the previous value.
    pub fn set_read_flag(&self, m: MessageId, read: bool) -> Result<bool> {
        let _scope = self.locks.acquire(&[(D::Message, M::Write)]);
        self.with_txn(|txn| map_not_found(txn.set_read_flag(m, read), || DbError::NoSuchMessage(m)))
    }

    pub fn get_unread_counts(&self) -> Result<BTreeMap<GroupId, usize>> {
        let _scope = self.locks.acquire(&[(D::Message, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_unread_counts()?))
    }

    // -----------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------

    /// Expire one sweep of the globally oldest messages, up to the
    /// configured byte budget, and bump every contact's retention version.
    /// Returns the number of messages expired.
    pub(super) fn expire_sweep(&self) -> Result<usize> {
        let _scope = self.locks.acquire(&[
            (D::Contact, M::Read),
            (D::Message, M::Write),
            (D::Retention, M::Write),
        ]);
        self.with_txn(|txn| {
            let ids = txn.get_old_messages(self.config.bytes_per_sweep as usize)?;
            if ids.is_empty() {
                return Ok(0);
            }
            for id in &ids {
                // Withdraw the message's contribution before the row goes.
                if txn.get_sendability(*id)? > 0 {
                    update_ancestor_sendability(txn, *id, false)?;
                }
                txn.remove_message(*id)?;
            }
            txn.increment_retention_versions()?;
            Ok(ids.len())
        })
    }
}

/// Initial sendability of a newly stored group message.
pub(super) fn calculate_sendability(txn: &Txn<'_>, m: &Message) -> Result<i64> {
    let mut sendability = 0;
    if let Some(author) = m.author {
        if txn.get_rating(author)? == Rating::Good {
            sendability += 1;
        }
    }
    sendability += txn.get_number_of_sendable_children(m.id)?;
    Ok(sendability)
}

/// Walk the reply chain upwards after `start` crossed the sendability
/// boundary, adjusting each ancestor's counter and continuing only while
/// the ancestor itself crosses.
pub(super) fn update_ancestor_sendability(
    txn: &Txn<'_>,
    start: MessageId,
    increment: bool,
) -> Result<()> {
    let mut current = start;
    loop {
        let Some(parent) = txn.get_group_message_parent(current)? else {
            break;
        };
        let before = txn.get_sendability(parent)?;
        let after = if increment { before + 1 } else { before - 1 };
        txn.set_sendability(parent, after)?;
        let crossed = if increment { before == 0 } else { after == 0 };
        if !crossed {
            break;
        }
        current = parent;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use driftnet_shared::Group;

    use crate::clock::ManualClock;
    use crate::config::SyncConfig;

    use super::*;

    fn engine_with_config(config: SyncConfig) -> Arc<SyncEngine> {
        let db = driftnet_store::Database::open_in_memory(config.capacity).unwrap();
        SyncEngine::with_database(db, config, Box::new(ManualClock::new(1_000_000)))
    }

    fn engine() -> Arc<SyncEngine> {
        engine_with_config(SyncConfig::default())
    }

    /// Engine with a contact subscribed, on both sides, to a visible group.
    fn peer(engine: &SyncEngine) -> (ContactId, Group) {
        let c = engine.add_contact("alice").unwrap();
        let g = Group::new("news", None);
        engine.subscribe(&g).unwrap();
        engine.set_visibility(g.id, &[c]).unwrap();
        engine
            .receive_subscription_update(
                c,
                &driftnet_shared::protocol::SubscriptionUpdate {
                    groups: vec![g.clone()],
                    version: 1,
                },
            )
            .unwrap();
        (c, g)
    }

    fn engine_with_peer() -> (Arc<SyncEngine>, ContactId, Group) {
        let engine = engine();
        let (c, g) = peer(&engine);
        (engine, c, g)
    }

    fn author() -> AuthorId {
        AuthorId([7u8; driftnet_shared::ID_LEN])
    }

    #[test]
    fn good_author_makes_message_sendable() {
        let (engine, _, g) = engine_with_peer();
        engine.set_rating(author(), Rating::Good).unwrap();

        let m = Message::new(None, Some(g.id), Some(author()), 100, b"x".to_vec());
        engine.store_local_group_message(m.clone()).unwrap();
        // Storing again is a no-op.
        engine.store_local_group_message(m).unwrap();
    }

    #[test]
    fn rating_change_propagates_up_the_thread() {
        let (engine, c, g) = engine_with_peer();

        // m1 <- m2 <- m3, m3 authored by the rated author.
        let m1 = Message::new(None, Some(g.id), None, 100, b"root".to_vec());
        let m2 = Message::new(Some(m1.id), Some(g.id), None, 200, b"mid".to_vec());
        let m3 = Message::new(Some(m2.id), Some(g.id), Some(author()), 300, b"leaf".to_vec());
        for m in [&m1, &m2, &m3] {
            engine.store_local_group_message(m.clone()).unwrap();
        }
        assert!(engine.generate_offer(c).unwrap().is_none());

        // Rating the leaf's author good makes the whole chain sendable.
        engine.set_rating(author(), Rating::Good).unwrap();
        let offer = engine.generate_offer(c).unwrap().unwrap();
        assert_eq!(offer.message_ids, vec![m1.id, m2.id, m3.id]);

        // Withdrawing the rating makes it unsendable again.
        engine.set_rating(author(), Rating::Unrated).unwrap();
        assert!(engine.generate_offer(c).unwrap().is_none());
    }

    #[test]
    fn received_future_message_is_dropped() {
        let (engine, c, g) = engine_with_peer();
        let m = Message::new(None, Some(g.id), None, 2_000_000, b"x".to_vec());
        engine.receive_message(c, m.clone()).unwrap();
        assert!(matches!(
            engine.get_message(m.id),
            Err(DbError::NoSuchMessage(_))
        ));
    }

    #[test]
    fn received_message_for_invisible_group_is_acked_but_dropped() {
        let (engine, c, _) = engine_with_peer();
        let hidden = Group::new("hidden", None);
        engine.subscribe(&hidden).unwrap();

        let m = Message::new(None, Some(hidden.id), None, 100, b"x".to_vec());
        engine.receive_message(c, m.clone()).unwrap();
        assert!(matches!(
            engine.get_message(m.id),
            Err(DbError::NoSuchMessage(_))
        ));
        let ack = engine.generate_ack(c).unwrap().unwrap();
        assert_eq!(ack.message_ids, vec![m.id]);
    }

    #[test]
    fn local_messages_are_read_and_received_ones_are_not() {
        let (engine, c, g) = engine_with_peer();

        let local = Message::new(None, Some(g.id), None, 100, b"mine".to_vec());
        engine.store_local_group_message(local.clone()).unwrap();

        let remote = Message::new(None, Some(g.id), None, 200, b"theirs".to_vec());
        engine.receive_message(c, remote.clone()).unwrap();

        let headers = engine.get_group_message_headers(g.id).unwrap();
        let by_id =
            |id: MessageId| headers.iter().find(|h| h.id == id).unwrap();
        assert!(by_id(local.id).read);
        assert!(!by_id(remote.id).read);
        assert_eq!(engine.get_unread_counts().unwrap().get(&g.id), Some(&1));

        engine.set_read_flag(remote.id, true).unwrap();
        assert_eq!(engine.get_unread_counts().unwrap().get(&g.id), None);
    }

    #[test]
    fn duplicate_receipt_is_idempotent() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (engine, c, g) = engine_with_peer();
        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        engine.events().subscribe(move |event| {
            if matches!(event, Event::MessageReceived { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let m = Message::new(None, Some(g.id), None, 100, b"x".to_vec());
        engine.receive_message(c, m.clone()).unwrap();
        engine.receive_message(c, m.clone()).unwrap();

        // Both receipts count, but only one copy is stored or acked.
        assert_eq!(received.load(Ordering::SeqCst), 2);
        let ack = engine.generate_ack(c).unwrap().unwrap();
        assert_eq!(ack.message_ids, vec![m.id]);
        assert_eq!(engine.get_group_message_headers(g.id).unwrap().len(), 1);
    }

    #[test]
    fn expiry_decrements_ancestors_before_deleting() {
        // A 4-byte sweep budget expires exactly one of the 4-byte bodies.
        let engine = engine_with_config(SyncConfig {
            bytes_per_sweep: 4,
            ..SyncConfig::default()
        });
        let (c, g) = peer(&engine);

        let m1 = Message::new(None, Some(g.id), None, 100, b"root".to_vec());
        let m2 = Message::new(Some(m1.id), Some(g.id), Some(author()), 200, b"leaf".to_vec());
        engine.store_local_group_message(m1.clone()).unwrap();
        engine.store_local_group_message(m2.clone()).unwrap();
        engine.set_rating(author(), Rating::Good).unwrap();

        let offer = engine.generate_offer(c).unwrap().unwrap();
        assert_eq!(offer.message_ids.len(), 2);

        // The root expires first (it is oldest); the leaf stays sendable.
        let expired = engine.expire_sweep().unwrap();
        assert_eq!(expired, 1);
        let offer = engine.generate_offer(c).unwrap().unwrap();
        assert_eq!(offer.message_ids, vec![m2.id]);
    }
}
