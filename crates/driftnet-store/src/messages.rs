//! Message storage, delivery statuses, pending acks, ratings and the
//! sendability counters.
//!
//! A message is sendable to a contact when its status for that contact is
//! `New` and either it is an outgoing private message addressed to the
//! contact, or it is a group message with positive sendability whose group
//! is visible to the contact, subscribed to by the contact, and whose
//! timestamp is not older than the contact's advertised retention time.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use driftnet_shared::{AuthorId, ContactId, GroupId, Message, MessageId, Rating, Status};

use crate::database::Txn;
use crate::error::{Result, StoreError};
use crate::models::MessageHeader;

/// Predicate over `messages m JOIN statuses s` selecting the rows that are
/// sendable to the contact bound as `s.contactId`.
const SENDABLE: &str = "s.status = 0 AND (
    (m.groupId IS NULL AND m.contactId = s.contactId AND m.incoming = 0)
    OR (m.groupId IS NOT NULL AND m.sendability > 0
        AND m.timestamp >= (SELECT retention FROM retentionVersions rv
                            WHERE rv.contactId = s.contactId)
        AND EXISTS (SELECT 1 FROM groupVisibilities gv
                    WHERE gv.contactId = s.contactId AND gv.groupId = m.groupId)
        AND EXISTS (SELECT 1 FROM contactGroups cg
                    WHERE cg.contactId = s.contactId AND cg.groupId = m.groupId)))";

impl Txn<'_> {
    // -----------------------------------------------------------------
    // Adding, fetching and removing messages
    // -----------------------------------------------------------------

    /// Store a group message.  The caller seeds statuses for the contacts
    /// the group is visible to.
    pub fn add_group_message(&self, m: &Message, incoming: bool) -> Result<()> {
        let group = m.group.as_ref().ok_or_else(|| {
            StoreError::Corrupt(format!("group message {} has no group", m.id))
        })?;
        self.conn().execute(
            "INSERT INTO messages
             (messageId, parentId, groupId, authorId, contactId, incoming,
              timestamp, length, body, sendability, read)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, 0, 0)",
            params![
                m.id.to_hex(),
                m.parent.map(|p| p.to_hex()),
                group.to_hex(),
                m.author.map(|a| a.to_hex()),
                incoming,
                m.timestamp,
                m.length(),
                m.body,
            ],
        )?;
        Ok(())
    }

    /// Store a private message exchanged with the contact.
    pub fn add_private_message(&self, m: &Message, c: ContactId, incoming: bool) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages
             (messageId, parentId, groupId, authorId, contactId, incoming,
              timestamp, length, body, sendability, read)
             VALUES (?1, ?2, NULL, NULL, ?3, ?4, ?5, ?6, ?7, 0, 0)",
            params![
                m.id.to_hex(),
                m.parent.map(|p| p.to_hex()),
                c.0,
                incoming,
                m.timestamp,
                m.length(),
                m.body,
            ],
        )?;
        Ok(())
    }

    /// Return true if the message is stored.
    pub fn contains_message(&self, m: MessageId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE messageId = ?1",
            params![m.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a stored message.
    pub fn get_message(&self, m: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT messageId, parentId, groupId, authorId, timestamp, body
                 FROM messages WHERE messageId = ?1",
                params![m.to_hex()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Delete a message.  Its statuses and pending acks cascade.
    pub fn remove_message(&self, m: MessageId) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE messageId = ?1",
            params![m.to_hex()],
        )?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Oldest stored messages whose lengths sum to at most `bytes`, for
    /// the space sweeper.  Stops before the message that would cross the
    /// budget, so a sweep never expires more than `bytes` bytes.
    pub fn get_old_messages(&self, bytes: usize) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT messageId, length FROM messages ORDER BY timestamp, messageId",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut ids = Vec::new();
        let mut total = 0usize;
        for row in rows {
            let (id, length) = row?;
            let length = length as usize;
            if total + length > bytes {
                break;
            }
            ids.push(decode_message_id(&id)?);
            total += length;
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------
    // Sendability counters and the reply graph
    // -----------------------------------------------------------------

    /// The message's parent, if the parent is stored and belongs to the
    /// same group.
    pub fn get_group_message_parent(&self, m: MessageId) -> Result<Option<MessageId>> {
        let parent: Option<String> = self
            .conn()
            .query_row(
                "SELECT p.messageId FROM messages AS m
                 JOIN messages AS p ON m.parentId = p.messageId
                 WHERE m.messageId = ?1 AND m.groupId IS NOT NULL
                 AND p.groupId = m.groupId",
                params![m.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        parent.as_deref().map(decode_message_id).transpose()
    }

    pub fn get_sendability(&self, m: MessageId) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT sendability FROM messages WHERE messageId = ?1",
                params![m.to_hex()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn set_sendability(&self, m: MessageId, sendability: i64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET sendability = ?1 WHERE messageId = ?2",
            params![sendability, m.to_hex()],
        )?;
        if affected != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Number of stored children of the message, in the same group, with
    /// positive sendability.
    pub fn get_number_of_sendable_children(&self, m: MessageId) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages AS child
             JOIN messages AS parent ON child.parentId = parent.messageId
             WHERE parent.messageId = ?1 AND child.groupId = parent.groupId
             AND child.sendability > 0",
            params![m.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ids of all stored group messages by the author.
    pub fn get_messages_by_author(&self, a: AuthorId) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT messageId FROM messages WHERE authorId = ?1 ORDER BY messageId",
        )?;
        let rows = stmt.query_map(params![a.to_hex()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(decode_message_id(&row?)?);
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------
    // Ratings
    // -----------------------------------------------------------------

    /// The author's rating, `Unrated` if none has been assigned.
    pub fn get_rating(&self, a: AuthorId) -> Result<Rating> {
        let rating: Option<i64> = self
            .conn()
            .query_row(
                "SELECT rating FROM ratings WHERE authorId = ?1",
                params![a.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        match rating {
            None => Ok(Rating::Unrated),
            Some(v) => Rating::from_i64(v)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid rating {}", v))),
        }
    }

    /// Assign a rating to the author, returning the previous one.
    pub fn set_rating(&self, a: AuthorId, rating: Rating) -> Result<Rating> {
        let old = self.get_rating(a)?;
        self.conn().execute(
            "INSERT INTO ratings (authorId, rating) VALUES (?1, ?2)
             ON CONFLICT (authorId) DO UPDATE SET rating = excluded.rating",
            params![a.to_hex(), rating as i64],
        )?;
        Ok(old)
    }

    // -----------------------------------------------------------------
    // Delivery statuses
    // -----------------------------------------------------------------

    /// Record a delivery status for the (message, contact) pair.  The
    /// stored status never moves backwards.
    pub fn set_status(&self, c: ContactId, m: MessageId, status: Status) -> Result<()> {
        self.conn().execute(
            "INSERT INTO statuses (messageId, contactId, status) VALUES (?1, ?2, ?3)
             ON CONFLICT (messageId, contactId)
             DO UPDATE SET status = MAX(status, excluded.status)",
            params![m.to_hex(), c.0, status as i64],
        )?;
        Ok(())
    }

    /// The delivery status for the pair, if one is recorded.
    pub fn get_status(&self, c: ContactId, m: MessageId) -> Result<Option<Status>> {
        let status: Option<i64> = self
            .conn()
            .query_row(
                "SELECT status FROM statuses WHERE messageId = ?1 AND contactId = ?2",
                params![m.to_hex(), c.0],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|v| {
                Status::from_i64(v)
                    .ok_or_else(|| StoreError::Corrupt(format!("invalid status {}", v)))
            })
            .transpose()
    }

    /// Mark messages just written to a batch as `Sent`.  Only `New` rows
    /// change, so a concurrent `Seen` is never demoted.
    pub fn set_statuses_sent(&self, c: ContactId, ids: &[MessageId]) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "UPDATE statuses SET status = 1
             WHERE messageId = ?1 AND contactId = ?2 AND status = 0",
        )?;
        for m in ids {
            stmt.execute(params![m.to_hex(), c.0])?;
        }
        Ok(())
    }

    /// Mark an acked message as `Seen`, but only from `Sent`.  An ack for
    /// a message that was never sent to the contact changes nothing.
    pub fn set_status_seen_if_sent(&self, c: ContactId, m: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE statuses SET status = 2
             WHERE messageId = ?1 AND contactId = ?2 AND status = 1",
            params![m.to_hex(), c.0],
        )?;
        Ok(affected == 1)
    }

    /// Mark a message offered by the contact as `Seen`, if the message is
    /// visible to the contact: stored in a group visible to it, or a
    /// private message exchanged with it.  Returns true if a status was
    /// recorded.
    pub fn set_status_seen_if_visible(&self, c: ContactId, m: MessageId) -> Result<bool> {
        let visible: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages AS msg
             LEFT JOIN groupVisibilities AS gv
               ON msg.groupId = gv.groupId AND gv.contactId = ?2
             WHERE msg.messageId = ?1
               AND (msg.contactId = ?2 OR gv.contactId IS NOT NULL)",
            params![m.to_hex(), c.0],
            |row| row.get(0),
        )?;
        if visible == 0 {
            return Ok(false);
        }
        self.set_status(c, m, Status::Seen)?;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Pending acks
    // -----------------------------------------------------------------

    /// Record that a message received from the contact still needs to be
    /// acknowledged.
    pub fn add_message_to_ack(&self, c: ContactId, m: MessageId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO messagesToAck (messageId, contactId) VALUES (?1, ?2)",
            params![m.to_hex(), c.0],
        )?;
        Ok(())
    }

    /// Up to `max` message ids awaiting acknowledgement to the contact.
    pub fn get_messages_to_ack(&self, c: ContactId, max: usize) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT messageId FROM messagesToAck WHERE contactId = ?1
             ORDER BY messageId LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![c.0, max as i64], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(decode_message_id(&row?)?);
        }
        Ok(ids)
    }

    /// Remove acks that have been written to an outgoing payload.
    pub fn remove_messages_to_ack(&self, c: ContactId, ids: &[MessageId]) -> Result<()> {
        let mut stmt = self
            .conn()
            .prepare("DELETE FROM messagesToAck WHERE messageId = ?1 AND contactId = ?2")?;
        for m in ids {
            stmt.execute(params![m.to_hex(), c.0])?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sendable selection
    // -----------------------------------------------------------------

    /// Oldest-first sendable messages for the contact whose lengths fit in
    /// `max_bytes`.
    pub fn get_sendable_messages(&self, c: ContactId, max_bytes: usize) -> Result<Vec<MessageId>> {
        let sql = format!(
            "SELECT m.messageId, m.length FROM messages AS m
             JOIN statuses AS s ON m.messageId = s.messageId
             WHERE s.contactId = ?1 AND {SENDABLE}
             ORDER BY m.timestamp, m.messageId"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![c.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut ids = Vec::new();
        let mut total = 0usize;
        for row in rows {
            let (id, length) = row?;
            if total + length as usize > max_bytes {
                break;
            }
            ids.push(decode_message_id(&id)?);
            total += length as usize;
        }
        Ok(ids)
    }

    /// Up to `max` sendable message ids to put in an offer, oldest first.
    pub fn get_messages_to_offer(&self, c: ContactId, max: usize) -> Result<Vec<MessageId>> {
        let sql = format!(
            "SELECT m.messageId FROM messages AS m
             JOIN statuses AS s ON m.messageId = s.messageId
             WHERE s.contactId = ?1 AND {SENDABLE}
             ORDER BY m.timestamp, m.messageId LIMIT ?2"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![c.0, max as i64], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(decode_message_id(&row?)?);
        }
        Ok(ids)
    }

    /// Fetch the message if it is currently sendable to the contact.
    pub fn get_message_if_sendable(&self, c: ContactId, m: MessageId) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT m.messageId, m.parentId, m.groupId, m.authorId, m.timestamp, m.body
             FROM messages AS m
             JOIN statuses AS s ON m.messageId = s.messageId
             WHERE s.contactId = ?1 AND m.messageId = ?2 AND {SENDABLE}"
        );
        let message = self
            .conn()
            .query_row(&sql, params![c.0, m.to_hex()], row_to_message)
            .optional()?;
        Ok(message)
    }

    // -----------------------------------------------------------------
    // Headers and read flags
    // -----------------------------------------------------------------

    /// Headers of all messages in the group, oldest first.
    pub fn get_group_message_headers(&self, g: GroupId) -> Result<Vec<MessageHeader>> {
        let mut stmt = self.conn().prepare(
            "SELECT messageId, parentId, groupId, authorId, contactId, incoming,
                    timestamp, length, read
             FROM messages WHERE groupId = ?1 ORDER BY timestamp, messageId",
        )?;
        let rows = stmt.query_map(params![g.to_hex()], row_to_header)?;

        let mut headers = Vec::new();
        for row in rows {
            headers.push(row?);
        }
        Ok(headers)
    }

    /// Headers of all private messages exchanged with the contact, oldest
    /// first.
    pub fn get_private_message_headers(&self, c: ContactId) -> Result<Vec<MessageHeader>> {
        let mut stmt = self.conn().prepare(
            "SELECT messageId, parentId, groupId, authorId, contactId, incoming,
                    timestamp, length, read
             FROM messages WHERE groupId IS NULL AND contactId = ?1
             ORDER BY timestamp, messageId",
        )?;
        let rows = stmt.query_map(params![c.0], row_to_header)?;

        let mut headers = Vec::new();
        for row in rows {
            headers.push(row?);
        }
        Ok(headers)
    }

    pub fn get_read_flag(&self, m: MessageId) -> Result<bool> {
        self.conn()
            .query_row(
                "SELECT read FROM messages WHERE messageId = ?1",
                params![m.to_hex()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Set the message's read flag, returning the previous value.
    pub fn set_read_flag(&self, m: MessageId, read: bool) -> Result<bool> {
        let old = self.get_read_flag(m)?;
        self.conn().execute(
            "UPDATE messages SET read = ?1 WHERE messageId = ?2",
            params![read, m.to_hex()],
        )?;
        Ok(old)
    }

    /// Unread message counts per subscribed group.
    pub fn get_unread_counts(&self) -> Result<BTreeMap<GroupId, usize>> {
        let mut stmt = self.conn().prepare(
            "SELECT groupId, COUNT(*) FROM messages
             WHERE groupId IS NOT NULL AND read = 0 GROUP BY groupId",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (id, count) = row?;
            counts.insert(GroupId(decode_id(&id)?), count as usize);
        }
        Ok(counts)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let group: Option<String> = row.get(2)?;
    let author: Option<String> = row.get(3)?;

    Ok(Message {
        id: MessageId(decode_id_sql(0, &id)?),
        parent: parent
            .map(|p| decode_id_sql(1, &p).map(MessageId))
            .transpose()?,
        group: group
            .map(|g| decode_id_sql(2, &g).map(GroupId))
            .transpose()?,
        author: author
            .map(|a| decode_id_sql(3, &a).map(AuthorId))
            .transpose()?,
        timestamp: row.get(4)?,
        body: row.get(5)?,
    })
}

fn row_to_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageHeader> {
    let id: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let group: Option<String> = row.get(2)?;
    let author: Option<String> = row.get(3)?;
    let contact: Option<i64> = row.get(4)?;

    Ok(MessageHeader {
        id: MessageId(decode_id_sql(0, &id)?),
        parent: parent
            .map(|p| decode_id_sql(1, &p).map(MessageId))
            .transpose()?,
        group: group
            .map(|g| decode_id_sql(2, &g).map(GroupId))
            .transpose()?,
        author: author
            .map(|a| decode_id_sql(3, &a).map(AuthorId))
            .transpose()?,
        contact: contact.map(ContactId),
        incoming: row.get(5)?,
        timestamp: row.get(6)?,
        length: row.get::<_, i64>(7)? as usize,
        read: row.get(8)?,
    })
}

/// Decode a hex id column inside a rusqlite row mapper.
pub(crate) fn decode_id_sql(col: usize, s: &str) -> rusqlite::Result<[u8; driftnet_shared::ID_LEN]> {
    let bytes = hex::decode(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })?;
    <[u8; driftnet_shared::ID_LEN]>::try_from(bytes).map_err(|bytes| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("bad id length {}", bytes.len()).into(),
        )
    })
}

fn decode_id(s: &str) -> Result<[u8; driftnet_shared::ID_LEN]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != driftnet_shared::ID_LEN {
        return Err(StoreError::Corrupt(format!("bad id length {}", bytes.len())));
    }
    let mut id = [0u8; driftnet_shared::ID_LEN];
    id.copy_from_slice(&bytes);
    Ok(id)
}

fn decode_message_id(s: &str) -> Result<MessageId> {
    decode_id(s).map(MessageId)
}
