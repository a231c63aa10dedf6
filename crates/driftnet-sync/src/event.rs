//! Engine events and their dispatch bus.
//!
//! Events are fired after the transaction that caused them has committed,
//! and outside all locks, so listeners may call back into the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use driftnet_shared::{AuthorId, ContactId, GroupId, Rating, TransportId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ContactAdded(ContactId),
    ContactRemoved(ContactId),
    /// A group message was stored, locally composed or received.
    GroupMessageAdded { group: GroupId, incoming: bool },
    /// A private message was stored, locally composed or received.
    PrivateMessageAdded { contact: ContactId, incoming: bool },
    /// A valid message arrived from a contact, whether or not it was
    /// stored (duplicates and invisible groups still count).
    MessageReceived { contact: ContactId },
    /// The cleaner expired this many messages.
    MessagesExpired(usize),
    RatingChanged { author: AuthorId, rating: Rating },
    SubscriptionAdded(GroupId),
    SubscriptionRemoved(GroupId),
    /// Local subscription visibility changed for these contacts.
    LocalSubscriptionsUpdated { affected: Vec<ContactId> },
    /// A contact's subscription update was applied.
    RemoteSubscriptionsUpdated(ContactId),
    /// A contact's retention update was applied.
    RemoteRetentionUpdated(ContactId),
    /// Local properties changed for a transport.
    LocalTransportsUpdated(TransportId),
    /// A contact's transport update was applied.
    RemoteTransportsUpdated {
        contact: ContactId,
        transport: TransportId,
    },
    TransportAdded(TransportId),
    TransportRemoved(TransportId),
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Dynamic listener registry with copy-on-iterate dispatch.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener.  Returns false if the id was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Deliver the event to every listener.  The registry is snapshotted
    /// under the mutex and the listeners run outside it, so a listener may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let id = bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Event::ContactAdded(ContactId(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&Event::ContactAdded(ContactId(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let id_slot = Arc::new(Mutex::new(None::<ListenerId>));

        let bus2 = bus.clone();
        let slot = id_slot.clone();
        let id = bus.subscribe(move |_| {
            if let Some(id) = *slot.lock() {
                bus2.unsubscribe(id);
            }
        });
        *id_slot.lock() = Some(id);

        bus.emit(&Event::ContactAdded(ContactId(1)));
        assert!(!bus.unsubscribe(id));
    }
}
