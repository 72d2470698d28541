//! Object segmentation: the distributed directory mapping each object to the
//! server currently simulating it, plus the local bookkeeping that makes the
//! common lookup path fast and migrations safe.

mod craq;
mod directory;
mod loc;

pub use craq::CraqSegmentation;
pub use directory::{
    DirEntry, DirKey, DirRequest, DirResult, DirectoryPool, DirectoryStore, MemoryStore,
    TcpStore, WriteToken,
};
pub use loc::LocSegmentation;

use std::time::Instant;

use loka_shared::{ObjectId, ServerId};

/// Answer to "who simulates this object right now?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    /// This server is authoritative (including the window where an outbound
    /// migration has not yet been acknowledged).
    Local,
    /// Route toward that server. May be a stale hint; the destination always
    /// consults its own local set before claiming ownership.
    Remote(ServerId),
    /// A directory read is in flight; the caller parks the work and resumes
    /// on [`OsegEvent::LookupComplete`].
    Pending,
}

/// Completion of a tracked `add_new` directory write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddStatus {
    Success,
    AlreadyRegistered,
}

/// Deferred outcomes posted by the segmentation to the server's main loop.
#[derive(Clone, Debug, PartialEq)]
pub enum OsegEvent {
    /// An asynchronous lookup resolved; anything held for `object` can be
    /// routed toward `server`.
    LookupComplete { object: ObjectId, server: ServerId },
    /// A new object's directory write finished; the session gatekeeper may
    /// finalize the connection.
    AddFinished { object: ObjectId, status: AddStatus },
    /// Destination side of a migration: the directory write committed and an
    /// acknowledgement must be routed to the old owner.
    SendAck { to: ServerId, object: ObjectId },
    /// Source side of a migration: the acknowledgement arrived, local state
    /// for the object can be torn down and held messages replayed.
    AckProcessed { object: ObjectId, new_owner: ServerId },
    /// An object left the world; peers should hear a directory tombstone.
    Tombstone { object: ObjectId },
}

/// The object directory as the rest of the server sees it. Implementations:
/// [`CraqSegmentation`] (directory-backed) and [`LocSegmentation`]
/// (CSEG-derived, read-only, static scenes only).
pub trait ObjectSegmentation: Send {
    fn lookup(&mut self, id: &ObjectId, now: Instant) -> LookupOutcome;

    /// Register a brand-new locally hosted object. Idempotent.
    fn add_new(&mut self, id: ObjectId, radius: f32, now: Instant);

    /// The object left this server for good (host disconnect or removal).
    fn remove(&mut self, id: &ObjectId, now: Instant);

    /// Begin migrating `id` away. Precondition: owned and clear to migrate.
    /// The authoritative directory write is performed by the *destination*;
    /// only local state changes here.
    fn migrate_out(&mut self, id: &ObjectId, to: ServerId, now: Instant);

    /// Destination side: install `id`, write the directory, and (if
    /// `gen_ack`) emit an acknowledgement to `ack_to` once the write lands.
    fn accept_migration(
        &mut self,
        id: ObjectId,
        radius: f32,
        ack_to: ServerId,
        gen_ack: bool,
        now: Instant,
    );

    /// True iff `id` is neither awaiting an outbound-migration ack nor an
    /// unacknowledged inbound migration.
    fn clear_to_migrate(&self, id: &ObjectId) -> bool;

    fn is_owned(&self, id: &ObjectId) -> bool;
    fn owned_count(&self) -> usize;

    /// Destination of an in-flight outbound migration, if any.
    fn migrating_to(&self, id: &ObjectId) -> Option<ServerId>;

    fn handle_migration_ack(&mut self, from: ServerId, object: ObjectId, now: Instant);
    fn handle_directory_update(&mut self, object: ObjectId, owner: ServerId, now: Instant);
    fn handle_dir_result(&mut self, result: DirResult, now: Instant);

    /// Drive retries: the not-found sit-out queue and failed-write backoff.
    fn service(&mut self, now: Instant);

    /// Run any inline directory-pool requests to completion. Production
    /// pools are threaded and ignore this; the deterministic tests use it.
    fn pump_directory(&mut self) {}

    fn take_events(&mut self) -> Vec<OsegEvent>;
}
