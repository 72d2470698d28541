//! Cooperative executors. Each subsystem is pinned to exactly one executor
//! and owns its state outright; everything that crosses an executor boundary
//! travels as a posted message. Handlers run to completion and never block on
//! another executor, so there is no lock-based sharing of hot-path data.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

/// Sending half of an executor's inbox. Cheap to clone and hand to other
/// executors.
pub struct Mailbox<M> {
    tx: Sender<M>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M> Mailbox<M> {
    /// Post a message. Returns `false` if the owning executor is gone, which
    /// only happens during shutdown.
    pub fn post(&self, msg: M) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Receiving half of an executor's inbox. Owned by exactly one executor.
pub struct Inbox<M> {
    rx: Receiver<M>,
}

impl<M> Inbox<M> {
    /// Everything currently queued, without blocking. The unit tests drive
    /// executors by draining inboxes by hand.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.rx.try_recv() {
            out.push(m);
        }
        out
    }

    pub fn try_recv(&self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next message. `None` means the timer
    /// fired first; the run loop uses that as its tick.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<M> {
        match self.rx.recv_timeout(timeout) {
            Ok(m) => Some(m),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Unbounded executor inbox.
pub fn mailbox<M>() -> (Mailbox<M>, Inbox<M>) {
    let (tx, rx) = mpsc::channel();
    (Mailbox { tx }, Inbox { rx })
}

/// Bounded producer used where overflow must shed load instead of buffering,
/// e.g. the per-peer receive queues feeding the main executor.
pub struct BoundedMailbox<M> {
    tx: SyncSender<M>,
}

impl<M> Clone for BoundedMailbox<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M> BoundedMailbox<M> {
    /// Post without blocking. `false` means the queue is full (or closing)
    /// and the message was dropped; the caller accounts for the drop.
    pub fn try_post(&self, msg: M) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub fn bounded_mailbox<M>(capacity: usize) -> (BoundedMailbox<M>, Inbox<M>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (BoundedMailbox { tx }, Inbox { rx })
}

/// Spawn a named executor thread running `body` until it returns.
pub fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawn executor thread")
}
