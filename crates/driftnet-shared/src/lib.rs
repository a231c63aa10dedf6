//! # driftnet-shared
//!
//! Identifiers, domain models and sync-protocol payload types shared by the
//! store and the synchronization engine.  Everything here is a plain value
//! type; all persistence and concurrency lives in the other crates.

pub mod constants;
pub mod models;
pub mod protocol;
pub mod types;

pub use models::*;
pub use types::*;
