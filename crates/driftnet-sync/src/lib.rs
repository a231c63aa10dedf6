//! # driftnet-sync
//!
//! The synchronization engine: a delay-tolerant, anti-entropy message
//! exchange over an embedded store (`driftnet-store`).  The engine owns
//! the concurrency discipline (seven ordered reader-writer locks), the
//! message sendability bookkeeping, the versioned exchange of
//! subscriptions, retention times and transport properties, and a
//! background cleaner that expires old messages when space runs low.
//!
//! All payloads the engine generates and consumes are defined in
//! `driftnet-shared::protocol`; framing, encryption and transport are the
//! caller's concern.

pub mod cleaner;
pub mod clock;
pub mod config;
pub mod engine;
pub mod event;
pub mod locks;

mod error;

pub use cleaner::{Cleaner, CleanerCallback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{DbError, Result};
pub use event::{Event, EventBus, ListenerId};
