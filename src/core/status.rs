//! Operational status flags shared across the daemon
//!
//! [`StatusStore`] holds the interception queue number and three independent
//! flags. Every read and write goes through one reader-writer lock, so a
//! reader never observes a half-updated record.
//!
//! Readers never fail: a poisoned lock or an absent store (see
//! [`StatusQuery`]) reads as `false`.

use std::sync::RwLock;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Status {
    queue_number: u16,
    running: bool,
    intercepting: bool,
    firewall_enabled: bool,
}

/// Lock-protected record of the firewall's operational flags
#[derive(Debug, Default)]
pub struct StatusStore {
    inner: RwLock<Status>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue where intercepted connections are sent.
    ///
    /// `None` leaves the current value untouched. Values outside the 16-bit
    /// queue space are truncated, not rejected.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_queue_number(&self, value: Option<i64>) {
        let Some(value) = value else {
            return;
        };
        self.write(|s| s.queue_number = value as u16);
    }

    pub fn queue_number(&self) -> u16 {
        self.read(|s| s.queue_number).unwrap_or_default()
    }

    pub fn set_running(&self, running: bool) {
        self.write(|s| s.running = running);
    }

    pub fn set_intercepting(&self, intercepting: bool) {
        self.write(|s| s.intercepting = intercepting);
    }

    pub fn set_firewall_enabled(&self, enabled: bool) {
        self.write(|s| s.firewall_enabled = enabled);
    }

    pub fn is_running(&self) -> bool {
        self.read(|s| s.running).unwrap_or(false)
    }

    pub fn is_firewall_enabled(&self) -> bool {
        self.read(|s| s.firewall_enabled).unwrap_or(false)
    }

    pub fn is_intercepting(&self) -> bool {
        self.read(|s| s.intercepting).unwrap_or(false)
    }

    fn read<T>(&self, f: impl FnOnce(&Status) -> T) -> Option<T> {
        self.inner.read().ok().map(|guard| f(&guard))
    }

    fn write(&self, f: impl FnOnce(&mut Status)) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => {
                tracing::warn!("Status lock poisoned, recovering");
                f(&mut poisoned.into_inner());
                self.inner.clear_poison();
            }
        }
    }
}

/// Status queries for a store that may not exist (not yet created, or
/// already torn down). An absent store reports every flag as `false`.
pub trait StatusQuery {
    fn is_running(&self) -> bool;
    fn is_firewall_enabled(&self) -> bool;
    fn is_intercepting(&self) -> bool;
}

impl StatusQuery for Option<&StatusStore> {
    fn is_running(&self) -> bool {
        self.is_some_and(StatusStore::is_running)
    }

    fn is_firewall_enabled(&self) -> bool {
        self.is_some_and(StatusStore::is_firewall_enabled)
    }

    fn is_intercepting(&self) -> bool {
        self.is_some_and(StatusStore::is_intercepting)
    }
}
