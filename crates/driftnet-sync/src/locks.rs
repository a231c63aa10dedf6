//! The engine's concurrency discipline: seven reader-writer locks, one per
//! state domain, always acquired in ascending domain order and released in
//! reverse.
//!
//! The individual locks are never exposed.  Callers name their whole lock
//! set up front and get a [`LockScope`] back; acquiring out of order panics
//! immediately instead of deadlocking later.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The seven lockable state domains, in their fixed acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockDomain {
    Contact = 0,
    Message = 1,
    Rating = 2,
    Retention = 3,
    Subscription = 4,
    Transport = 5,
    Window = 6,
}

const DOMAINS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Default)]
pub struct LockManager {
    locks: [RwLock<()>; DOMAINS],
}

enum Guard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Holds a set of lock guards.  Dropping the scope releases them in
/// reverse acquisition order.
pub struct LockScope<'a> {
    guards: Vec<Guard<'a>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the given locks.  Panics if the domains are not strictly
    /// ascending: a fixed global order is what makes deadlock impossible.
    pub fn acquire(&self, set: &[(LockDomain, LockMode)]) -> LockScope<'_> {
        let mut guards = Vec::with_capacity(set.len());
        let mut last: Option<LockDomain> = None;
        for &(domain, mode) in set {
            if let Some(prev) = last {
                assert!(
                    domain > prev,
                    "lock domains must be acquired in ascending order: {:?} after {:?}",
                    domain,
                    prev
                );
            }
            last = Some(domain);
            let lock = &self.locks[domain as usize];
            guards.push(match mode {
                LockMode::Read => Guard::Read(lock.read()),
                LockMode::Write => Guard::Write(lock.write()),
            });
        }
        LockScope { guards }
    }
}

impl Drop for LockScope<'_> {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while self.guards.pop().is_some() {}
    }
}
