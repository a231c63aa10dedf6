use serde::{Deserialize, Serialize};

use crate::models::{Group, TransportProperties};
use crate::types::{MessageId, TransportId};

/// All sync protocol payloads exchanged between paired peers.
///
/// These are generated and consumed by the synchronization engine; framing,
/// encryption and transport are external concerns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncPayload {
    /// Acknowledges received messages
    Ack(Ack),

    /// Offers messages the sender could transmit
    Offer(Offer),

    /// Requests a subset of a previously received offer
    Request(Request),

    /// A batch of raw messages
    Batch(Batch),

    /// The sender's current subscriptions
    SubscriptionUpdate(SubscriptionUpdate),

    /// Acknowledges a subscription update
    SubscriptionAck(SubscriptionAck),

    /// The sender's current message retention time
    RetentionUpdate(RetentionUpdate),

    /// Acknowledges a retention update
    RetentionAck(RetentionAck),

    /// Properties for one of the sender's transports
    TransportUpdate(TransportUpdate),

    /// Acknowledges a transport update
    TransportAck(TransportAck),
}

/// Acknowledges messages received from the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub message_ids: Vec<MessageId>,
}

/// Message ids the sender is willing to transmit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Offer {
    pub message_ids: Vec<MessageId>,
}

/// Response to an [`Offer`]: one bit per offered id, set if the receiver
/// still wants the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    len: u32,
    bits: Vec<u8>,
}

impl Request {
    /// Create an all-zero request bitmap for an offer of `len` ids.
    pub fn new(len: usize) -> Self {
        Self {
            len: len as u32,
            bits: vec![0; len.div_ceil(8)],
        }
    }

    /// Number of ids in the offer this request answers.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the `i`th offered message as wanted.
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len as usize);
        self.bits[i / 8] |= 1 << (i % 8);
    }

    /// Whether the `i`th offered message is wanted.
    pub fn requested(&self, i: usize) -> bool {
        i < self.len as usize && self.bits[i / 8] & (1 << (i % 8)) != 0
    }
}

/// Raw serialized messages, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub messages: Vec<Vec<u8>>,
}

impl Batch {
    /// Total payload length in bytes.
    pub fn length(&self) -> usize {
        self.messages.iter().map(Vec::len).sum()
    }
}

/// The sender's complete subscription list, replacing any previous state
/// if `version` is newer than what the receiver holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub groups: Vec<Group>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionAck {
    pub version: u64,
}

/// The sender's message retention time: messages older than `retention`
/// (ms since epoch, rounded down) need not be sent to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionUpdate {
    pub retention: i64,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionAck {
    pub version: u64,
}

/// Properties for one of the sender's transports, replacing any previous
/// state if `version` is newer than what the receiver holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportUpdate {
    pub transport: TransportId,
    pub properties: TransportProperties,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportAck {
    pub transport: TransportId,
    pub version: u64,
}

impl SyncPayload {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
