//! v001 -- Initial schema creation.
//!
//! Creates every table of the logical model: contacts, groups, messages,
//! statuses, pending acks, ratings, visibility rows, remote subscriptions,
//! versioned exchange tuples, transports and temporary secrets.
//!
//! Content-derived ids (messages, groups, authors) are stored as hex TEXT;
//! timestamps are INTEGER milliseconds since the Unix epoch.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    contactId     INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    lastConnected INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Groups (local subscriptions)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    groupId   TEXT PRIMARY KEY NOT NULL,     -- hex-encoded 32-byte id
    name      TEXT NOT NULL,
    publicKey BLOB                           -- NULL = unrestricted group
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    messageId   TEXT PRIMARY KEY NOT NULL,   -- hex-encoded 32-byte id
    parentId    TEXT,                        -- reply edge, same group only
    groupId     TEXT,                        -- NULL = private message
    authorId    TEXT,                        -- NULL = private/anonymous
    contactId   INTEGER,                     -- private messages: the peer
    incoming    INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    timestamp   INTEGER NOT NULL,            -- ms since epoch
    length      INTEGER NOT NULL,
    body        BLOB NOT NULL,
    sendability INTEGER NOT NULL DEFAULT 0,
    read        INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1

    FOREIGN KEY (groupId) REFERENCES groups(groupId) ON DELETE CASCADE,
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_author ON messages(authorId);
CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parentId);

-- ----------------------------------------------------------------
-- Per-(message, contact) delivery status: 0 new, 1 sent, 2 seen
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS statuses (
    messageId TEXT NOT NULL,
    contactId INTEGER NOT NULL,
    status    INTEGER NOT NULL,

    PRIMARY KEY (messageId, contactId),
    FOREIGN KEY (messageId) REFERENCES messages(messageId) ON DELETE CASCADE,
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Received messages not yet acknowledged to their sender
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messagesToAck (
    messageId TEXT NOT NULL,
    contactId INTEGER NOT NULL,

    PRIMARY KEY (messageId, contactId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Per-author trust ratings: 0 unrated, 1 good, 2 bad
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS ratings (
    authorId TEXT PRIMARY KEY NOT NULL,
    rating   INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Which contacts may receive each local group's messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groupVisibilities (
    contactId INTEGER NOT NULL,
    groupId   TEXT NOT NULL,

    PRIMARY KEY (contactId, groupId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE,
    FOREIGN KEY (groupId) REFERENCES groups(groupId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Groups each contact has told us it subscribes to
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contactGroups (
    contactId INTEGER NOT NULL,
    groupId   TEXT NOT NULL,
    name      TEXT NOT NULL,
    publicKey BLOB,

    PRIMARY KEY (contactId, groupId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Versioned exchange state for subscriptions, one row per contact
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groupVersions (
    contactId     INTEGER PRIMARY KEY NOT NULL,
    localVersion  INTEGER NOT NULL,
    localAcked    INTEGER NOT NULL,
    remoteVersion INTEGER NOT NULL,
    remoteAcked   INTEGER NOT NULL,

    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Versioned exchange state for retention time, one row per contact.
-- `retention` is the contact's advertised retention time.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS retentionVersions (
    contactId     INTEGER PRIMARY KEY NOT NULL,
    retention     INTEGER NOT NULL,
    localVersion  INTEGER NOT NULL,
    localAcked    INTEGER NOT NULL,
    remoteVersion INTEGER NOT NULL,
    remoteAcked   INTEGER NOT NULL,

    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Transport plugins and their local configuration / properties
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS transports (
    transportId TEXT PRIMARY KEY NOT NULL
);

CREATE TABLE IF NOT EXISTS transportConfigs (
    transportId TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,

    PRIMARY KEY (transportId, key),
    FOREIGN KEY (transportId) REFERENCES transports(transportId) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS transportProperties (
    transportId TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,

    PRIMARY KEY (transportId, key),
    FOREIGN KEY (transportId) REFERENCES transports(transportId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Versioned exchange state for transport properties.
-- Local side: one row per (contact, local transport).
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS transportVersions (
    contactId    INTEGER NOT NULL,
    transportId  TEXT NOT NULL,
    localVersion INTEGER NOT NULL,
    localAcked   INTEGER NOT NULL,

    PRIMARY KEY (contactId, transportId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE,
    FOREIGN KEY (transportId) REFERENCES transports(transportId) ON DELETE CASCADE
);

-- Remote side: one row per (contact, remote transport).  The remote
-- transport id has no FK: we may not run that transport ourselves.
CREATE TABLE IF NOT EXISTS contactTransportVersions (
    contactId     INTEGER NOT NULL,
    transportId   TEXT NOT NULL,
    remoteVersion INTEGER NOT NULL,
    remoteAcked   INTEGER NOT NULL,

    PRIMARY KEY (contactId, transportId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS contactTransportProperties (
    contactId   INTEGER NOT NULL,
    transportId TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,

    PRIMARY KEY (contactId, transportId, key),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Contact transports (key rotation endpoints) and temporary secrets
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contactTransports (
    contactId   INTEGER NOT NULL,
    transportId TEXT NOT NULL,
    epoch       INTEGER NOT NULL,
    alice       INTEGER NOT NULL,            -- boolean 0/1

    PRIMARY KEY (contactId, transportId),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE,
    FOREIGN KEY (transportId) REFERENCES transports(transportId) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS secrets (
    contactId   INTEGER NOT NULL,
    transportId TEXT NOT NULL,
    period      INTEGER NOT NULL,
    secret      BLOB NOT NULL,
    outgoing    INTEGER NOT NULL,
    centre      INTEGER NOT NULL,
    bitmap      BLOB NOT NULL,

    PRIMARY KEY (contactId, transportId, period),
    FOREIGN KEY (contactId) REFERENCES contacts(contactId) ON DELETE CASCADE,
    FOREIGN KEY (transportId) REFERENCES transports(transportId) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
