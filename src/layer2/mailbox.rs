// Mailbox - single-slot latest-value handoff from the ingestion thread
// Publish overwrites; each value is taken at most once

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Slot<T> {
    value: Option<T>,
    published: u64,
    overwritten: u64,
    taken: u64,
    closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub published: u64,
    /// Values replaced before anyone took them
    pub overwritten: u64,
    pub taken: u64,
}

impl fmt::Display for MailboxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MailboxStats(published={}, overwritten={}, taken={})",
            self.published, self.overwritten, self.taken
        )
    }
}

/// Latest-value slot shared between the ingestion thread and readers.
///
/// Blocking readers use `take_timeout`, async readers use `recv`.
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
    notify: Notify,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                published: 0,
                overwritten: 0,
                taken: 0,
                closed: false,
            }),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Replace the slot contents. Returns false once closed.
    pub fn publish(&self, value: T) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return false;
            }
            if slot.value.replace(value).is_some() {
                slot.overwritten += 1;
            }
            slot.published += 1;
        }
        self.condvar.notify_all();
        self.notify.notify_one();
        true
    }

    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        let value = slot.value.take();
        if value.is_some() {
            slot.taken += 1;
        }
        value
    }

    /// Block until a value is available, the mailbox closes, or `timeout` passes
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                slot.taken += 1;
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            if self.condvar.wait_until(&mut slot, deadline).timed_out() {
                let value = slot.value.take();
                if value.is_some() {
                    slot.taken += 1;
                }
                return value;
            }
        }
    }

    /// Wait for the next value. None once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Register interest before checking so a publish in between is not lost
            let notified = self.notify.notified();
            {
                let mut slot = self.slot.lock();
                if let Some(value) = slot.value.take() {
                    slot.taken += 1;
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further publishes and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub fn published_count(&self) -> u64 {
        self.slot.lock().published
    }

    pub fn stats(&self) -> MailboxStats {
        let slot = self.slot.lock();
        MailboxStats {
            published: slot.published,
            overwritten: slot.overwritten,
            taken: slot.taken,
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox({})", self.stats())
    }
}
