use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::warn;

use loka_shared::{ObjectId, ServerId};

use super::{AddStatus, DirResult, LookupOutcome, ObjectSegmentation, OsegEvent};

/// Segmentation derived from coordinate segmentation instead of a directory:
/// every object's owner is whoever owns the cell its (static) position falls
/// in. There is no external store, so ownership can never move — all
/// migration entry points refuse. Only useful for static scenes; the real
/// deployments run [`super::CraqSegmentation`].
pub struct LocSegmentation {
    id: ServerId,
    owned: HashSet<ObjectId>,
    /// Remote placements resolved against CSEG when the scene was loaded.
    placements: HashMap<ObjectId, ServerId>,
    events: Vec<OsegEvent>,
}

impl LocSegmentation {
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            owned: HashSet::new(),
            placements: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Record where a static object lives. `server == self` marks it owned.
    pub fn place(&mut self, object: ObjectId, server: ServerId) {
        if server == self.id {
            self.owned.insert(object);
        } else {
            self.placements.insert(object, server);
        }
    }
}

impl ObjectSegmentation for LocSegmentation {
    fn lookup(&mut self, id: &ObjectId, _now: Instant) -> LookupOutcome {
        if self.owned.contains(id) {
            return LookupOutcome::Local;
        }
        match self.placements.get(id) {
            Some(server) => LookupOutcome::Remote(*server),
            // unknown id: nothing will ever resolve it, but per the lookup
            // contract this still never surfaces as an error
            None => LookupOutcome::Pending,
        }
    }

    fn add_new(&mut self, id: ObjectId, _radius: f32, _now: Instant) {
        let status = if self.owned.insert(id) {
            AddStatus::Success
        } else {
            AddStatus::AlreadyRegistered
        };
        self.events.push(OsegEvent::AddFinished { object: id, status });
    }

    fn remove(&mut self, id: &ObjectId, _now: Instant) {
        self.owned.remove(id);
        self.placements.remove(id);
        self.events.push(OsegEvent::Tombstone { object: *id });
    }

    fn migrate_out(&mut self, id: &ObjectId, to: ServerId, _now: Instant) {
        warn!(
            "loc segmentation cannot migrate {} to {}; it is read-only",
            id, to
        );
    }

    fn accept_migration(
        &mut self,
        id: ObjectId,
        _radius: f32,
        ack_to: ServerId,
        _gen_ack: bool,
        _now: Instant,
    ) {
        warn!(
            "loc segmentation refuses inbound migration of {} from {}",
            id, ack_to
        );
    }

    fn clear_to_migrate(&self, _id: &ObjectId) -> bool {
        false
    }

    fn is_owned(&self, id: &ObjectId) -> bool {
        self.owned.contains(id)
    }

    fn owned_count(&self) -> usize {
        self.owned.len()
    }

    fn migrating_to(&self, _id: &ObjectId) -> Option<ServerId> {
        None
    }

    fn handle_migration_ack(&mut self, from: ServerId, object: ObjectId, _now: Instant) {
        warn!("stale migration ack for {} from {} on loc segmentation", object, from);
    }

    fn handle_directory_update(&mut self, object: ObjectId, owner: ServerId, _now: Instant) {
        if owner.is_nil() {
            self.placements.remove(&object);
        } else if owner != self.id {
            self.placements.insert(object, owner);
        }
    }

    fn handle_dir_result(&mut self, _result: DirResult, _now: Instant) {}

    fn service(&mut self, _now: Instant) {}

    fn take_events(&mut self) -> Vec<OsegEvent> {
        std::mem::take(&mut self.events)
    }
}
