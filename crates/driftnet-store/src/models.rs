//! Row types returned by the store that are not shared domain models.

use serde::{Deserialize, Serialize};

use driftnet_shared::{AuthorId, ContactId, GroupId, MessageId};

/// Metadata for a stored message, without its body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    pub parent: Option<MessageId>,
    pub group: Option<GroupId>,
    pub author: Option<AuthorId>,
    /// For private messages, the peer the message was exchanged with.
    pub contact: Option<ContactId>,
    /// True if the message was received rather than locally composed.
    pub incoming: bool,
    /// Creation time, ms since the Unix epoch.
    pub timestamp: i64,
    /// Stored size in bytes.
    pub length: usize,
    /// Whether the local user has read the message.
    pub read: bool,
}
