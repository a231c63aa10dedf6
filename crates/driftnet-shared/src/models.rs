//! Domain model value types.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can cross the
//! sync protocol or be handed to a UI layer unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AuthorId, ContactId, GroupId, MessageId, TransportId};

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A topic the user may subscribe to.  A `public_key` of `None` means the
/// group is unrestricted; private 1:1 messages carry no group at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    /// Content-derived identifier.
    pub id: GroupId,
    /// Human-readable group name.
    pub name: String,
    /// Public key restricting who may post, if any.
    pub public_key: Option<Vec<u8>>,
}

impl Group {
    /// Create a group, deriving its id from the name and public key.
    /// The name is length-prefixed and the key tagged with a presence
    /// byte, so no two distinct (name, key) pairs hash alike.
    pub fn new(name: impl Into<String>, public_key: Option<Vec<u8>>) -> Self {
        let name = name.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        match &public_key {
            Some(key) => {
                hasher.update(&[1]);
                hasher.update(key);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self {
            id: GroupId(*hasher.finalize().as_bytes()),
            name,
            public_key,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An immutable message.  `group == None` means a private 1:1 message;
/// `author == None` means the message is private or anonymous.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Content-derived identifier.
    pub id: MessageId,
    /// Parent message in the same group, for reply threading.
    pub parent: Option<MessageId>,
    /// Group the message belongs to, or `None` for a private message.
    pub group: Option<GroupId>,
    /// Author identity, or `None` for private/anonymous messages.
    pub author: Option<AuthorId>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Serialized message body (opaque to the store).
    pub body: Vec<u8>,
}

impl Message {
    /// Build a message, deriving its id from all other fields.  Each
    /// optional field is tagged with a presence byte before hashing, so a
    /// missing parent cannot be mistaken for a group of the same bytes.
    pub fn new(
        parent: Option<MessageId>,
        group: Option<GroupId>,
        author: Option<AuthorId>,
        timestamp: i64,
        body: Vec<u8>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        update_tagged(&mut hasher, parent.as_ref().map(|p| &p.0));
        update_tagged(&mut hasher, group.as_ref().map(|g| &g.0));
        update_tagged(&mut hasher, author.as_ref().map(|a| &a.0));
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(&body);
        Self {
            id: MessageId(*hasher.finalize().as_bytes()),
            parent,
            group,
            author,
            timestamp,
            body,
        }
    }

    /// Total stored size of the message in bytes.
    pub fn length(&self) -> usize {
        self.body.len()
    }
}

/// Hash an optional fixed-size id preceded by a presence byte.
fn update_tagged(hasher: &mut blake3::Hasher, id: Option<&[u8; crate::types::ID_LEN]>) {
    match id {
        Some(id) => {
            hasher.update(&[1]);
            hasher.update(id);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Per-(message, contact) delivery state.  Transitions are monotone:
/// `New -> Sent -> Seen`, and `Seen` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    New = 0,
    Sent = 1,
    Seen = 2,
}

impl Status {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            1 => Some(Self::Sent),
            2 => Some(Self::Seen),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rating
// ---------------------------------------------------------------------------

/// Per-author trust rating, one input to the sendability heuristic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Rating {
    Unrated = 0,
    Good = 1,
    Bad = 2,
}

impl Rating {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Unrated),
            1 => Some(Self::Good),
            2 => Some(Self::Bad),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Key-value properties advertised for a transport (addresses, ports).
pub type TransportProperties = BTreeMap<String, String>;

/// Local-only configuration for a transport plugin.
pub type TransportConfig = BTreeMap<String, String>;

/// A (contact, transport) pairing: the contact is reachable over the
/// transport, and key rotation for the pair started at `epoch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactTransport {
    pub contact: ContactId,
    pub transport: TransportId,
    /// Start of the key rotation schedule, ms since the Unix epoch.
    pub epoch: i64,
    /// True if the local device plays the Alice role in key derivation.
    pub alice: bool,
}

// ---------------------------------------------------------------------------
// Temporary secrets
// ---------------------------------------------------------------------------

/// Forward-secret key material for one (contact, transport, period).
///
/// `centre` and `bitmap` form the sliding replay-detection window over
/// incoming connection counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemporarySecret {
    pub contact: ContactId,
    pub transport: TransportId,
    /// Key rotation period number.
    pub period: i64,
    /// The secret itself (opaque to the store).
    pub secret: Vec<u8>,
    /// Outgoing connection counter.
    pub outgoing: i64,
    /// Centre of the replay-detection window.
    pub centre: i64,
    /// Window bitmap, one bit per counter value around the centre.
    pub bitmap: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A paired remote peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    /// Display name agreed at pairing time.
    pub name: String,
    /// Time a connection to this contact was last made, ms since epoch,
    /// or 0 if never connected.
    pub last_connected: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_depends_on_content() {
        let a = Message::new(None, None, None, 42, b"hello".to_vec());
        let b = Message::new(None, None, None, 42, b"hello".to_vec());
        let c = Message::new(None, None, None, 42, b"world".to_vec());
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn message_id_depends_on_parent_and_group() {
        let g = Group::new("test", None);
        let parent = Message::new(None, Some(g.id), None, 1, b"p".to_vec());
        let with_parent = Message::new(Some(parent.id), Some(g.id), None, 2, b"m".to_vec());
        let without_parent = Message::new(None, Some(g.id), None, 2, b"m".to_vec());
        assert_ne!(with_parent.id, without_parent.id);
    }

    #[test]
    fn message_id_distinguishes_which_field_is_set() {
        use crate::types::ID_LEN;

        // The same 32 bytes in different optional slots must not collide.
        let x = [7u8; ID_LEN];
        let as_parent = Message::new(Some(MessageId(x)), None, None, 1, b"m".to_vec());
        let as_group = Message::new(None, Some(GroupId(x)), None, 1, b"m".to_vec());
        let as_author = Message::new(None, None, Some(AuthorId(x)), 1, b"m".to_vec());
        assert_ne!(as_parent.id, as_group.id);
        assert_ne!(as_parent.id, as_author.id);
        assert_ne!(as_group.id, as_author.id);
    }

    #[test]
    fn group_id_separates_name_from_key() {
        let a = Group::new("a\u{1}", None);
        let b = Group::new("a", Some(vec![0]));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn group_id_is_stable() {
        let a = Group::new("news", None);
        let b = Group::new("news", None);
        let c = Group::new("news", Some(vec![1, 2, 3]));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn status_ordering_is_monotone() {
        assert!(Status::New < Status::Sent);
        assert!(Status::Sent < Status::Seen);
    }
}
