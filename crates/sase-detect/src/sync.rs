//! Reload sync state
//!
//! `IDLE → RELOAD_REQUESTED → SWAPPING → DONE → IDLE`, shared between the
//! side that asks for a reload and the control thread that performs it.

use crate::error::{DetectError, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    ReloadRequested,
    Swapping,
    Done,
}

#[derive(Debug)]
struct Inner {
    state: SyncState,
    /// A `trigger_and_wait` caller collects the outcome
    waiter: bool,
    /// Outcome of the last finished reload
    last_error: Option<String>,
}

/// Reload request/status handshake
pub struct ReloadSyncer {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ReloadSyncer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                waiter: false,
                last_error: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// Ask for a reload without waiting for it; rejected unless idle
    pub fn request_reload(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.request(&mut inner, false)
    }

    fn request(&self, inner: &mut Inner, waiter: bool) -> Result<()> {
        if inner.state != SyncState::Idle {
            return Err(DetectError::ReloadInProgress);
        }
        inner.state = SyncState::ReloadRequested;
        inner.waiter = waiter;
        self.changed.notify_all();
        Ok(())
    }

    pub fn is_requested(&self) -> bool {
        self.state() == SyncState::ReloadRequested
    }

    /// Control thread picks up the request; false if none is pending
    pub fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SyncState::ReloadRequested {
            return false;
        }
        inner.state = SyncState::Swapping;
        self.changed.notify_all();
        true
    }

    pub fn is_started(&self) -> bool {
        self.state() == SyncState::Swapping
    }

    /// Control thread finished, successfully or not. Without a waiter the
    /// syncer goes straight back to idle.
    pub fn set_done(&self, error: Option<String>) {
        let mut inner = self.inner.lock();
        inner.state = if inner.waiter {
            SyncState::Done
        } else {
            SyncState::Idle
        };
        inner.last_error = error;
        self.changed.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state() == SyncState::Done
    }

    /// Collect a finished reload, returning the syncer to idle.
    /// False if no reload was waiting to be collected.
    pub fn finish(&self) -> bool {
        let mut inner = self.inner.lock();
        self.finish_locked(&mut inner)
    }

    fn finish_locked(&self, inner: &mut Inner) -> bool {
        if inner.state != SyncState::Done {
            return false;
        }
        inner.state = SyncState::Idle;
        inner.waiter = false;
        self.changed.notify_all();
        true
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Request a reload and wait until the control thread finished it.
    /// Returns the reload's error, if any; `Aborted` on timeout.
    pub fn trigger_and_wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        self.request(&mut inner, true)?;

        while inner.state != SyncState::Done {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                // Nobody collects this reload any more
                inner.waiter = false;
                if inner.state == SyncState::ReloadRequested {
                    inner.state = SyncState::Idle;
                    self.changed.notify_all();
                }
                return Err(DetectError::Aborted("timed out waiting for reload".into()));
            }
        }
        self.finish_locked(&mut inner);
        match inner.last_error.clone() {
            None => Ok(()),
            Some(error) => Err(DetectError::Aborted(error)),
        }
    }

    /// Block until a request is pending or `timeout` passes
    pub fn wait_requested(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state != SyncState::ReloadRequested {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return false;
            }
        }
        true
    }
}

impl Default for ReloadSyncer {
    fn default() -> Self {
        Self::new()
    }
}
