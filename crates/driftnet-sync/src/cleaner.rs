//! Background thread that keeps the message store under its capacity.
//!
//! The cleaner wakes at a fixed interval, asks its callback whether a
//! space check is due, and runs the check if so.  Running out of space
//! with nothing left to expire is unrecoverable: the error is logged and
//! the process aborts rather than keep accepting writes it cannot store.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{DbError, Result};

pub trait CleanerCallback: Send + Sync + 'static {
    /// Whether enough bytes have been stored, or enough time has passed,
    /// to warrant a free-space check.
    fn should_check_free_space(&self) -> bool;

    /// Check free space and expire old messages until it recovers.
    fn check_free_space_and_clean(&self) -> Result<()>;
}

pub struct Cleaner {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// Spawn the cleaner thread, waking every `sweep_interval`.
    pub fn start(callback: Arc<dyn CleanerCallback>, sweep_interval: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("cleaner".into())
            .spawn(move || run(callback, thread_stop, sweep_interval))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (lock, cvar) = &*self.stop;
        *lock.lock() = true;
        cvar.notify_all();
        if handle.join().is_err() {
            tracing::warn!("cleaner thread panicked");
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn run(callback: Arc<dyn CleanerCallback>, stop: Arc<(Mutex<bool>, Condvar)>, interval: Duration) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "cleaner started");
    let (lock, cvar) = &*stop;
    let mut stopped = lock.lock();
    loop {
        if *stopped {
            break;
        }
        let timed_out = cvar.wait_for(&mut stopped, interval).timed_out();
        if *stopped {
            break;
        }
        if !timed_out {
            continue;
        }
        // The stop mutex is released while cleaning, so a shutdown request
        // is never blocked behind a sweep.
        drop(stopped);
        if callback.should_check_free_space() {
            if let Err(e) = callback.check_free_space_and_clean() {
                tracing::error!(error = %e, "free space check failed");
                if matches!(e, DbError::CriticalSpace) {
                    std::process::abort();
                }
            }
        }
        stopped = lock.lock();
    }
    tracing::debug!("cleaner stopped");
}
