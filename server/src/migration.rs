use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use loka_shared::{Datagram, MigrateRecord, ObjectId, Point3, Region, ServerId, SessionId};

use crate::loc_service::LocationService;

/// Source-side record of one in-flight outbound migration, alive from
/// `migrate_out` until the destination's ack (or forced cleanup).
pub struct OutgoingMigration {
    pub to: ServerId,
    pub started: Instant,
    /// Datagrams that arrived after authority left but before the ack;
    /// replayed FIFO once routing can resolve the new owner.
    pub pending_forward: VecDeque<Datagram>,
    /// Token of the object-connection binding frozen at migrate-out; if the
    /// object re-migrates home first, the tokens differ and the eventual
    /// cleanup leaves the new binding alone.
    pub conn_token: u64,
    timed_out_logged: bool,
}

/// Destination-side bookkeeping: payload and host connect may arrive in
/// either order, and traffic for the object buffers until both have.
pub struct MigrationManager {
    outgoing: HashMap<ObjectId, OutgoingMigration>,
    /// Payloads received, awaiting the host's migration connect.
    payloads: HashMap<ObjectId, (MigrateRecord, Instant)>,
    /// Host connects received, awaiting the payload.
    awaiting_host: HashMap<ObjectId, (SessionId, Instant)>,
    /// Inbound objects between install and directory-write completion.
    installing: HashMap<ObjectId, VecDeque<Datagram>>,
    /// Payload frames that could not be queued yet (peer-queue backpressure).
    unsent_payloads: VecDeque<(ServerId, MigrateRecord)>,
    timeout: Duration,
    grace: Duration,
}

const PENDING_FORWARD_LIMIT: usize = 1024;

impl MigrationManager {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            outgoing: HashMap::new(),
            payloads: HashMap::new(),
            awaiting_host: HashMap::new(),
            installing: HashMap::new(),
            unsent_payloads: VecDeque::new(),
            timeout,
            grace,
        }
    }

    // Source side

    pub fn begin_outgoing(
        &mut self,
        object: ObjectId,
        to: ServerId,
        conn_token: u64,
        now: Instant,
    ) {
        self.outgoing.insert(
            object,
            OutgoingMigration {
                to,
                started: now,
                pending_forward: VecDeque::new(),
                conn_token,
                timed_out_logged: false,
            },
        );
    }

    pub fn outgoing(&self, object: &ObjectId) -> Option<&OutgoingMigration> {
        self.outgoing.get(object)
    }

    pub fn is_migrating_out(&self, object: &ObjectId) -> bool {
        self.outgoing.contains_key(object)
    }

    /// Retire the source record and hand back its buffered traffic for
    /// replay. Called on ack-driven cleanup and on forced expiry.
    pub fn finish_outgoing(&mut self, object: &ObjectId) -> Option<OutgoingMigration> {
        self.outgoing.remove(object)
    }

    pub fn queue_payload(&mut self, to: ServerId, record: MigrateRecord) {
        self.unsent_payloads.push_back((to, record));
    }

    /// Payload frames waiting on peer-queue room; the caller re-queues any
    /// it still cannot send.
    pub fn take_unsent_payloads(&mut self) -> VecDeque<(ServerId, MigrateRecord)> {
        std::mem::take(&mut self.unsent_payloads)
    }

    // Destination side

    pub fn store_payload(&mut self, record: MigrateRecord, now: Instant) {
        self.payloads.insert(record.object, (record, now));
    }

    pub fn store_host_connect(&mut self, object: ObjectId, session: SessionId, now: Instant) {
        self.awaiting_host.insert(object, (session, now));
    }

    pub fn has_payload(&self, object: &ObjectId) -> bool {
        self.payloads.contains_key(object)
    }

    /// Both halves present? Consume and return them.
    pub fn take_rendezvous(&mut self, object: &ObjectId) -> Option<(MigrateRecord, SessionId)> {
        if !(self.payloads.contains_key(object) && self.awaiting_host.contains_key(object)) {
            return None;
        }
        let (record, _) = self.payloads.remove(object).unwrap();
        let (session, _) = self.awaiting_host.remove(object).unwrap();
        Some((record, session))
    }

    pub fn begin_install(&mut self, object: ObjectId) {
        self.installing.entry(object).or_default();
    }

    /// Directory write landed: the object is fully here. Returns traffic
    /// buffered during the install window.
    pub fn finish_install(&mut self, object: &ObjectId) -> VecDeque<Datagram> {
        self.installing.remove(object).unwrap_or_default()
    }

    // Shared

    /// If `object` is mid-migration on either side, buffer the datagram on
    /// the owning record and return true.
    pub fn buffer_if_migrating(&mut self, object: &ObjectId, dg: Datagram) -> bool {
        if let Some(rec) = self.outgoing.get_mut(object) {
            push_bounded(&mut rec.pending_forward, dg, object);
            return true;
        }
        if let Some(queue) = self.installing.get_mut(object) {
            push_bounded(queue, dg, object);
            return true;
        }
        if self.payloads.contains_key(object) || self.awaiting_host.contains_key(object) {
            let queue = self.installing.entry(*object).or_default();
            push_bounded(queue, dg, object);
            return true;
        }
        false
    }

    pub fn has_record(&self, object: &ObjectId) -> bool {
        self.outgoing.contains_key(object)
            || self.payloads.contains_key(object)
            || self.awaiting_host.contains_key(object)
            || self.installing.contains_key(object)
    }

    /// Periodic sweep. Returns (expired source records with their buffered
    /// traffic, abandoned inbound payloads to tombstone upstream, host
    /// connects whose payload never arrived).
    pub fn sweep(
        &mut self,
        now: Instant,
    ) -> (
        Vec<(ObjectId, OutgoingMigration)>,
        Vec<(ObjectId, ServerId)>,
        Vec<(ObjectId, SessionId)>,
    ) {
        // source records: warn at the budget, expire at twice it
        for (object, rec) in self.outgoing.iter_mut() {
            if !rec.timed_out_logged && now.duration_since(rec.started) > self.timeout {
                warn!(
                    "migration of {} to {} exceeded its {:?} budget; leaving in limbo",
                    object, rec.to, self.timeout
                );
                rec.timed_out_logged = true;
            }
        }
        let expired: Vec<ObjectId> = self
            .outgoing
            .iter()
            .filter(|(_, rec)| now.duration_since(rec.started) > self.timeout * 2)
            .map(|(o, _)| *o)
            .collect();
        let mut expired_records = Vec::new();
        for object in expired {
            info!("expiring migration record for {}", object);
            if let Some(rec) = self.outgoing.remove(&object) {
                expired_records.push((object, rec));
            }
        }

        // inbound payloads whose host never showed up
        let abandoned: Vec<ObjectId> = self
            .payloads
            .iter()
            .filter(|(object, (_, since))| {
                !self.awaiting_host.contains_key(object)
                    && now.duration_since(*since) > self.grace
            })
            .map(|(o, _)| *o)
            .collect();
        let mut tombstones = Vec::new();
        for object in abandoned {
            let (record, _) = self.payloads.remove(&object).unwrap();
            self.installing.remove(&object);
            warn!(
                "host never connected for migrated {}; deleting installed state",
                object
            );
            tombstones.push((object, record.src_server));
        }

        // the mirror case: a host said Migration but no payload ever came
        let stale_hosts: Vec<ObjectId> = self
            .awaiting_host
            .iter()
            .filter(|(object, (_, since))| {
                !self.payloads.contains_key(object) && now.duration_since(*since) > self.grace
            })
            .map(|(o, _)| *o)
            .collect();
        let mut refused = Vec::new();
        for object in stale_hosts {
            let (session, _) = self.awaiting_host.remove(&object).unwrap();
            self.installing.remove(&object);
            warn!("no payload ever arrived for migrating {}; refusing the host", object);
            refused.push((object, session));
        }
        (expired_records, tombstones, refused)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outgoing.is_empty()
            && self.payloads.is_empty()
            && self.installing.is_empty()
            && self.unsent_payloads.is_empty()
    }
}

fn push_bounded(queue: &mut VecDeque<Datagram>, dg: Datagram, object: &ObjectId) {
    if queue.len() >= PENDING_FORWARD_LIMIT {
        warn!("migration forward queue for {} full; dropping oldest", object);
        queue.pop_front();
    }
    queue.push_back(dg);
}

/// Watches locally simulated objects and reports the ones whose current
/// position has left this server's region.
pub struct MigrationMonitor {
    region: Region,
}

impl MigrationMonitor {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    pub fn set_region(&mut self, region: Region) {
        debug!("migration monitor now watching {} boxes", region.len());
        self.region = region;
    }

    pub fn on_this_server(&self, p: Point3) -> bool {
        self.region.iter().any(|b| b.contains(p))
    }

    /// Objects whose extrapolated position at `at` (µs) is outside every box
    /// this server owns.
    pub fn crossed(&self, loc: &dyn LocationService, owned: &[ObjectId], at: u64) -> Vec<ObjectId> {
        owned
            .iter()
            .filter(|id| match loc.current_position(**id, at) {
                Some(p) => !self.on_this_server(p),
                None => false,
            })
            .copied()
            .collect()
    }
}
