use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-scoped event counters. Thread-safe, shared by handle, and never
/// consulted on the routing path; the run loop reports them at shutdown.
#[derive(Default)]
pub struct Counters {
    pub lookups: AtomicU64,
    pub lookups_local: AtomicU64,
    pub cache_hits: AtomicU64,
    pub directory_lookups: AtomicU64,
    pub not_found_retries: AtomicU64,
    pub datagrams_delivered: AtomicU64,
    pub datagrams_forwarded: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub hop_limit_drops: AtomicU64,
    pub recv_overflow_drops: AtomicU64,
    pub send_rejects: AtomicU64,
    pub migrations_started: AtomicU64,
    pub migrations_completed: AtomicU64,
    pub peer_disconnects: AtomicU64,
    pub protocol_violations: AtomicU64,
}

pub type CountersHandle = Arc<Counters>;

impl Counters {
    pub fn new_handle() -> CountersHandle {
        Arc::new(Counters::default())
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) {
        log::info!(
            "counters: lookups={} (local={} cache={} directory={}) delivered={} forwarded={} \
             dropped={} (hop-limit={} recv-overflow={}) send-rejects={} migrations={}/{} \
             peer-disconnects={} protocol-violations={} not-found-retries={}",
            self.lookups.load(Ordering::Relaxed),
            self.lookups_local.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.directory_lookups.load(Ordering::Relaxed),
            self.datagrams_delivered.load(Ordering::Relaxed),
            self.datagrams_forwarded.load(Ordering::Relaxed),
            self.datagrams_dropped.load(Ordering::Relaxed),
            self.hop_limit_drops.load(Ordering::Relaxed),
            self.recv_overflow_drops.load(Ordering::Relaxed),
            self.send_rejects.load(Ordering::Relaxed),
            self.migrations_completed.load(Ordering::Relaxed),
            self.migrations_started.load(Ordering::Relaxed),
            self.peer_disconnects.load(Ordering::Relaxed),
            self.protocol_violations.load(Ordering::Relaxed),
            self.not_found_retries.load(Ordering::Relaxed),
        );
    }
}
