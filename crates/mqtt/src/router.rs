//! Mailbox registry and fan-out of inbound envelopes.
//!
//! Every waiter (a correlated command, a telemetry stream, a status probe)
//! owns one bounded [`Mailbox`]. The dispatcher task copies each decoded
//! envelope into every mailbox registered at that moment:
//!
//! ```text
//!                      ┌──▶ Mailbox #1 (get_controller waiter)
//! dispatcher ──deliver─┼──▶ Mailbox #2 (telemetry stream)
//!                      └──▶ Mailbox #3 (heartbeat monitor)
//! ```
//!
//! A mailbox is registered when its [`WaitQueue`] guard is created and
//! deregistered when the guard is dropped, on every exit path including a
//! cancelled future. Creating the guard *before* publishing a command is what
//! closes the race where a fast reply lands before the wait begins.
//!
//! A full mailbox evicts its oldest entry.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tokio::sync::Notify;
use tracing::trace;

use super::envelope::Envelope;

/// Default number of envelopes a mailbox holds before evicting.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct Mailbox {
    id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if an older entry was evicted to make room.
    fn push(&self, envelope: Envelope) -> bool {
        let evicted = {
            let mut queue = self.queue();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(envelope);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn try_pop(&self) -> Option<Envelope> {
        self.queue().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.queue().len()
    }
}

#[derive(Debug, Default)]
struct Registry {
    mailboxes: Mutex<Vec<Arc<Mailbox>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn mailboxes(&self) -> MutexGuard<'_, Vec<Arc<Mailbox>>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        self.mailboxes().retain(|m| m.id != id);
    }
}

/// Shared handle to the mailbox registry. Cloning shares the registry.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    capacity: usize,
}

impl Router {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            capacity,
        }
    }

    /// Allocates and registers a mailbox.
    pub fn register(&self) -> WaitQueue {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(id, self.capacity));
        self.registry.mailboxes().push(mailbox.clone());
        trace!(mailbox = id, "Mailbox registered");
        WaitQueue {
            mailbox,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Copies `envelope` into every currently registered mailbox.
    ///
    /// Iterates a snapshot so that waiters registering or dropping during
    /// delivery never contend with the fan-out.
    pub fn deliver(&self, envelope: &Envelope) {
        let snapshot: Vec<Arc<Mailbox>> = self.registry.mailboxes().clone();
        for mailbox in snapshot {
            if mailbox.push(envelope.clone()) {
                trace!(mailbox = mailbox.id, topic = %envelope.topic(), "Mailbox full, evicted oldest");
            }
        }
    }

    /// Wakes every waiter and marks its mailbox closed. Buffered envelopes
    /// can still be drained.
    pub fn close_all(&self) {
        for mailbox in self.registry.mailboxes().iter() {
            mailbox.close();
        }
    }

    /// Number of registered mailboxes.
    pub fn registered(&self) -> usize {
        self.registry.mailboxes().len()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

/// Registration guard for one mailbox. Dropping it deregisters the mailbox.
#[derive(Debug)]
pub struct WaitQueue {
    mailbox: Arc<Mailbox>,
    registry: Weak<Registry>,
}

impl WaitQueue {
    pub fn id(&self) -> u64 {
        self.mailbox.id
    }

    /// Waits for the next envelope. Returns `None` once the router closed
    /// this mailbox and it has been drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.mailbox.try_pop() {
                return Some(envelope);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Receives until an envelope on `leaf` (echoing `command`, when given)
    /// arrives. Non-matching envelopes are discarded.
    pub async fn recv_matching(&self, leaf: &str, command: Option<&str>) -> Option<Envelope> {
        while let Some(envelope) = self.recv().await {
            if envelope.matches(leaf, command) {
                return Some(envelope);
            }
        }
        None
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.mailbox.try_pop()
    }

    /// Number of buffered envelopes.
    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.mailbox.id);
            trace!(mailbox = self.mailbox.id, "Mailbox released");
        }
    }
}
