//! # driftnet-store
//!
//! The embedded transactional store behind the synchronization engine,
//! backed by SQLite.  The crate exposes a synchronous [`Database`] handle
//! that wraps a `rusqlite::Connection`, and a [`Txn`] type carrying the
//! primitive accessors and mutators for every entity: contacts, messages,
//! statuses, ratings, groups, versioned exchange tuples, transports and
//! temporary secrets.
//!
//! This crate knows nothing about locking.  The concurrency discipline
//! (which operations may run under which of the engine's seven locks)
//! lives entirely in `driftnet-sync`; a replacement backend only needs to
//! reimplement the primitives here.

pub mod contacts;
pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod retention;
pub mod secrets;
pub mod transports;

mod error;

pub use database::{Database, Txn};
pub use error::{Result, StoreError};
pub use models::*;
