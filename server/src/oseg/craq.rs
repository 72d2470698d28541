use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use loka_shared::{ObjectId, ServerId, TtlLruCache};

use super::directory::{DirEntry, DirKey, DirRequest, DirResult, DirectoryPool, WriteToken};
use super::{AddStatus, LookupOutcome, ObjectSegmentation, OsegEvent};
use crate::telemetry::{Counters, CountersHandle};

/// How long a not-found lookup sits out before the directory is asked again.
const DEFAULT_NOT_FOUND_SIT_OUT: Duration = Duration::from_millis(500);
/// Give up re-asking for a never-registered id after this many attempts; the
/// lookup then stays pending until a directory update names an owner.
const NOT_FOUND_MAX_ATTEMPTS: u32 = 8;
/// Base delay for retrying a failed directory write.
const WRITE_RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transit {
    /// A directory read is in flight (or sitting out a not-found).
    Lookup,
    /// The object is migrating away and the ack has not come back yet.
    Migrating(ServerId),
}

#[derive(Clone, Debug)]
enum WritePurpose {
    AddNew { object: ObjectId },
    MigrationAck { object: ObjectId, ack_to: ServerId },
    /// Fire-and-forget write (tombstones, unacked re-announcements); no
    /// event on completion, retried like everything else.
    Silent,
}

#[derive(Clone, Debug)]
struct PendingWrite {
    key: DirKey,
    entry: DirEntry,
    purpose: WritePurpose,
    attempts: u32,
    retry_at: Option<Instant>,
}

struct NotFound {
    object: ObjectId,
    retry_at: Instant,
}

/// The directory-backed object segmentation. Local truth lives in `owned`;
/// the external store is consulted for everything else through two
/// independent connection pools, and a bounded TTL cache keeps the common
/// routing path off the network.
pub struct CraqSegmentation {
    id: ServerId,
    prefix: u8,

    owned: HashSet<ObjectId>,
    /// Bounding radius last announced for each local object.
    radii: HashMap<ObjectId, f32>,
    in_transit: HashMap<ObjectId, Transit>,
    receiving: HashSet<ObjectId>,
    cache: TtlLruCache<ObjectId, ServerId>,

    key_to_object: HashMap<DirKey, ObjectId>,
    writes: HashMap<WriteToken, PendingWrite>,
    next_token: WriteToken,

    not_found: VecDeque<NotFound>,
    not_found_attempts: HashMap<ObjectId, u32>,
    not_found_sit_out: Duration,
    /// Lookups waiting for an outstanding-read slot.
    lookup_overflow: VecDeque<ObjectId>,
    outstanding_reads: usize,
    max_outstanding_reads: usize,
    write_retry_cap: Duration,

    get_pool: DirectoryPool,
    set_pool: DirectoryPool,

    counters: CountersHandle,
    events: Vec<OsegEvent>,
}

impl CraqSegmentation {
    pub fn new(
        id: ServerId,
        prefix: u8,
        cache_size: usize,
        cache_ttl: Duration,
        lookup_queue: usize,
        get_pool: DirectoryPool,
        set_pool: DirectoryPool,
        counters: CountersHandle,
    ) -> Self {
        Self {
            id,
            prefix,
            owned: HashSet::new(),
            radii: HashMap::new(),
            in_transit: HashMap::new(),
            receiving: HashSet::new(),
            cache: TtlLruCache::new(cache_size, cache_ttl),
            key_to_object: HashMap::new(),
            writes: HashMap::new(),
            next_token: 1,
            not_found: VecDeque::new(),
            not_found_attempts: HashMap::new(),
            not_found_sit_out: DEFAULT_NOT_FOUND_SIT_OUT,
            lookup_overflow: VecDeque::new(),
            outstanding_reads: 0,
            max_outstanding_reads: lookup_queue.max(1),
            write_retry_cap: cache_ttl,
            get_pool,
            set_pool,
            counters,
            events: Vec::new(),
        }
    }

    pub fn set_not_found_sit_out(&mut self, sit_out: Duration) {
        self.not_found_sit_out = sit_out;
    }

    /// Run queued inline-pool requests; used by the deterministic tests.
    pub fn pump_pools(&mut self) {
        self.get_pool.pump();
        self.set_pool.pump();
    }

    fn key(&self, object: &ObjectId) -> DirKey {
        DirKey::new(self.prefix, object)
    }

    fn take_token(&mut self) -> WriteToken {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn submit_read(&mut self, object: ObjectId) {
        if self.outstanding_reads >= self.max_outstanding_reads {
            self.lookup_overflow.push_back(object);
            return;
        }
        let key = self.key(&object);
        self.key_to_object.insert(key, object);
        self.outstanding_reads += 1;
        Counters::bump(&self.counters.directory_lookups);
        self.get_pool.submit(DirRequest::Get { key });
    }

    fn submit_write(&mut self, entry: DirEntry, object: &ObjectId, purpose: WritePurpose) {
        let token = self.take_token();
        let key = self.key(object);
        self.writes.insert(
            token,
            PendingWrite { key, entry, purpose, attempts: 0, retry_at: None },
        );
        self.set_pool.submit(DirRequest::Set { key, entry, token });
    }

    fn begin_lookup(&mut self, object: ObjectId) {
        if self.in_transit.contains_key(&object) {
            // already being looked up or migrating; one read is enough
            return;
        }
        self.in_transit.insert(object, Transit::Lookup);
        self.submit_read(object);
    }

    /// True iff an unfinished write would re-emit the same migration ack.
    fn has_pending_ack_write(&self, object: &ObjectId) -> bool {
        self.writes.values().any(|w| {
            matches!(&w.purpose, WritePurpose::MigrationAck { object: o, .. } if o == object)
        })
    }

    fn has_pending_add_write(&self, object: &ObjectId) -> bool {
        self.writes.values().any(|w| {
            matches!(&w.purpose, WritePurpose::AddNew { object: o } if o == object)
        })
    }

    fn write_finished(&mut self, token: WriteToken, now: Instant) {
        let write = match self.writes.remove(&token) {
            Some(w) => w,
            None => return,
        };
        match write.purpose {
            WritePurpose::AddNew { object } => {
                let status = if self.owned.contains(&object) {
                    AddStatus::AlreadyRegistered
                } else {
                    self.owned.insert(object);
                    AddStatus::Success
                };
                self.cache.insert(object, self.id, now);
                self.events.push(OsegEvent::AddFinished { object, status });
            }
            WritePurpose::MigrationAck { object, ack_to } => {
                // now the directory agrees: this server owns the object
                self.cache.insert(object, self.id, now);
                self.owned.insert(object);
                self.in_transit.remove(&object);
                self.receiving.remove(&object);
                self.events.push(OsegEvent::SendAck { to: ack_to, object });
            }
            WritePurpose::Silent => {}
        }
    }

    fn write_failed(&mut self, token: WriteToken, now: Instant) {
        if let Some(write) = self.writes.get_mut(&token) {
            write.attempts += 1;
            let backoff = WRITE_RETRY_BASE * 2u32.saturating_pow(write.attempts.min(16));
            let backoff = backoff.min(self.write_retry_cap);
            let jitter = Duration::from_millis(fastrand::u64(0..50));
            write.retry_at = Some(now + backoff + jitter);
            debug!(
                "directory write {} failed (attempt {}); retrying in {:?}",
                token, write.attempts, backoff
            );
        }
    }

    fn read_finished(&mut self, key: DirKey, entry: Option<DirEntry>, now: Instant) {
        self.outstanding_reads = self.outstanding_reads.saturating_sub(1);
        while self.outstanding_reads < self.max_outstanding_reads {
            match self.lookup_overflow.pop_front() {
                Some(queued) => self.submit_read(queued),
                None => break,
            }
        }

        let object = match self.key_to_object.get(&key) {
            Some(o) => *o,
            // no record of ever asking; nothing to resolve
            None => return,
        };

        match entry {
            Some(e) if !e.server.is_nil() => {
                self.key_to_object.remove(&key);
                self.not_found_attempts.remove(&object);
                self.cache.insert(object, e.server, now);
                if self.in_transit.get(&object) == Some(&Transit::Lookup) {
                    // a migrate request that raced in wins; keep its record
                    self.in_transit.remove(&object);
                }
                self.events.push(OsegEvent::LookupComplete { object, server: e.server });
            }
            _ => {
                // not found (or unreachable backend): sit out, then ask again
                let attempts = self.not_found_attempts.entry(object).or_insert(0);
                if *attempts >= NOT_FOUND_MAX_ATTEMPTS {
                    debug!(
                        "lookup for {} exhausted {} not-found retries; parking until registered",
                        object, attempts
                    );
                    return;
                }
                *attempts += 1;
                self.not_found.push_back(NotFound {
                    object,
                    retry_at: now + self.not_found_sit_out,
                });
            }
        }
    }
}

impl ObjectSegmentation for CraqSegmentation {
    fn lookup(&mut self, id: &ObjectId, now: Instant) -> LookupOutcome {
        Counters::bump(&self.counters.lookups);

        if self.owned.contains(id) {
            Counters::bump(&self.counters.lookups_local);
            return LookupOutcome::Local;
        }

        // migrating away but unacknowledged: still authoritative here
        if matches!(self.in_transit.get(id), Some(Transit::Migrating(_))) {
            Counters::bump(&self.counters.lookups_local);
            return LookupOutcome::Local;
        }

        if let Some(&server) = self.cache.get(id, now) {
            // a self hit would mean re-routing to ourselves forever; only the
            // two checks above may claim locality
            if server != self.id {
                Counters::bump(&self.counters.cache_hits);
                return LookupOutcome::Remote(server);
            }
        }

        self.begin_lookup(*id);
        LookupOutcome::Pending
    }

    fn add_new(&mut self, id: ObjectId, radius: f32, now: Instant) {
        if self.owned.contains(&id) {
            self.events
                .push(OsegEvent::AddFinished { object: id, status: AddStatus::AlreadyRegistered });
            return;
        }
        if self.has_pending_add_write(&id) {
            // second registration attempt while the first write is in
            // flight; the first completion answers both
            return;
        }
        self.radii.insert(id, radius);
        let entry = DirEntry { server: self.id, radius };
        self.submit_write(entry, &id, WritePurpose::AddNew { object: id });
        let _ = now;
    }

    fn remove(&mut self, id: &ObjectId, now: Instant) {
        self.owned.remove(id);
        self.radii.remove(id);
        self.in_transit.remove(id);
        self.receiving.remove(id);
        self.cache.remove(id);
        let entry = DirEntry { server: ServerId::NIL, radius: 0.0 };
        self.submit_write(entry, id, WritePurpose::Silent);
        self.events.push(OsegEvent::Tombstone { object: *id });
        let _ = now;
    }

    fn migrate_out(&mut self, id: &ObjectId, to: ServerId, now: Instant) {
        info!("object {} begins migration {} -> {}", id, self.id, to);
        self.in_transit.insert(*id, Transit::Migrating(to));
        if !self.owned.remove(id) {
            warn!("migrate_out for {} which was not in the owned set", id);
        }
        let _ = now;
    }

    fn accept_migration(
        &mut self,
        id: ObjectId,
        radius: f32,
        ack_to: ServerId,
        gen_ack: bool,
        now: Instant,
    ) {
        if gen_ack {
            if self.receiving.contains(&id) && self.has_pending_ack_write(&id) {
                // duplicate accept; the in-flight write will produce the ack
                return;
            }
            self.receiving.insert(id);
            self.radii.insert(id, radius);
            let entry = DirEntry { server: self.id, radius };
            self.submit_write(entry, &id, WritePurpose::MigrationAck { object: id, ack_to });
        } else {
            self.radii.insert(id, radius);
            let entry = DirEntry { server: self.id, radius };
            self.submit_write(entry, &id, WritePurpose::Silent);
            self.owned.insert(id);
            self.cache.insert(id, self.id, now);
        }
    }

    fn clear_to_migrate(&self, id: &ObjectId) -> bool {
        let migrating_from_here = matches!(self.in_transit.get(id), Some(Transit::Migrating(_)));
        let migrating_to_here = self.receiving.contains(id);
        !migrating_from_here && !migrating_to_here
    }

    fn is_owned(&self, id: &ObjectId) -> bool {
        self.owned.contains(id)
    }

    fn owned_count(&self) -> usize {
        self.owned.len()
    }

    fn migrating_to(&self, id: &ObjectId) -> Option<ServerId> {
        match self.in_transit.get(id) {
            Some(Transit::Migrating(to)) => Some(*to),
            _ => None,
        }
    }

    fn handle_migration_ack(&mut self, from: ServerId, object: ObjectId, now: Instant) {
        // the cache learns the new owner before the transit record dies, so
        // the very next lookup already resolves remotely
        self.cache.insert(object, from, now);
        if self.in_transit.remove(&object).is_some() {
            info!("migration of {} acknowledged by {}", object, from);
            self.events.push(OsegEvent::AckProcessed { object, new_owner: from });
        } else {
            // e.g. cleanup already expired the record
            warn!("stale migration ack for {} from {}; discarding", object, from);
        }
    }

    fn handle_directory_update(&mut self, object: ObjectId, owner: ServerId, now: Instant) {
        if owner.is_nil() {
            self.cache.remove(&object);
            return;
        }
        if owner != self.id && self.owned.contains(&object) {
            // external state disagrees with local authority; never dispossess
            // on a hint alone, re-announce ourselves instead
            warn!(
                "directory names {} as owner of locally-owned {}; re-announcing",
                owner, object
            );
            let radius = self.radii.get(&object).copied().unwrap_or(0.0);
            let entry = DirEntry { server: self.id, radius };
            self.submit_write(entry, &object, WritePurpose::Silent);
            return;
        }
        self.cache.insert(object, owner, now);
        // a parked lookup (not-found exhausted or sitting out) resolves here
        if self.in_transit.get(&object) == Some(&Transit::Lookup) {
            self.in_transit.remove(&object);
            self.not_found.retain(|nf| nf.object != object);
            self.not_found_attempts.remove(&object);
            self.events.push(OsegEvent::LookupComplete { object, server: owner });
        }
    }

    fn handle_dir_result(&mut self, result: DirResult, now: Instant) {
        match result {
            DirResult::Get { key, entry } => self.read_finished(key, entry, now),
            DirResult::SetDone { token, ok } => {
                if ok {
                    self.write_finished(token, now);
                } else {
                    self.write_failed(token, now);
                }
            }
        }
    }

    fn service(&mut self, now: Instant) {
        // not-found sit-outs that are due go back to the directory; the next
        // miss re-queues them with the attempt count bumped
        loop {
            let due = matches!(self.not_found.front(), Some(nf) if nf.retry_at <= now);
            if !due {
                break;
            }
            let nf = self.not_found.pop_front().unwrap();
            if self.in_transit.get(&nf.object) != Some(&Transit::Lookup) {
                // resolved some other way in the meantime
                self.not_found_attempts.remove(&nf.object);
                continue;
            }
            Counters::bump(&self.counters.not_found_retries);
            self.submit_read(nf.object);
        }

        // failed writes whose backoff elapsed
        let due: Vec<WriteToken> = self
            .writes
            .iter()
            .filter(|(_, w)| w.retry_at.map(|at| at <= now).unwrap_or(false))
            .map(|(t, _)| *t)
            .collect();
        for token in due {
            if let Some(write) = self.writes.get_mut(&token) {
                write.retry_at = None;
                let (key, entry) = (write.key, write.entry);
                self.set_pool.submit(DirRequest::Set { key, entry, token });
            }
        }
    }

    fn pump_directory(&mut self) {
        self.pump_pools();
    }

    fn take_events(&mut self) -> Vec<OsegEvent> {
        std::mem::take(&mut self.events)
    }
}
