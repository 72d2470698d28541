use std::collections::HashMap;

use loka_shared::{Bounds, Motion, ObjectId, OrientationSample, Point3};

/// What the core needs from the location collaborator: the latest motion
/// tuple for each locally simulated object, stored verbatim. `update_time`
/// acts as a version; stale samples are ignored.
pub trait LocationService: Send {
    fn add_local(
        &mut self,
        id: ObjectId,
        motion: Motion,
        orientation: OrientationSample,
        bounds: Bounds,
        mesh: String,
    );
    fn remove_local(&mut self, id: ObjectId);
    fn update_motion(&mut self, id: ObjectId, motion: Motion);

    fn motion(&self, id: ObjectId) -> Option<Motion>;
    fn orientation(&self, id: ObjectId) -> Option<OrientationSample>;
    fn bounds(&self, id: ObjectId) -> Option<Bounds>;
    fn mesh(&self, id: ObjectId) -> Option<String>;

    /// Extrapolated position at time `at` (microseconds).
    fn current_position(&self, id: ObjectId, at: u64) -> Option<Point3>;

    fn local_objects(&self) -> Vec<ObjectId>;
}

#[derive(Clone, Debug)]
struct LocRecord {
    motion: Motion,
    orientation: OrientationSample,
    bounds: Bounds,
    mesh: String,
}

/// In-process implementation backing the tests and the default deployment.
#[derive(Default)]
pub struct StandardLocationService {
    records: HashMap<ObjectId, LocRecord>,
}

impl StandardLocationService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationService for StandardLocationService {
    fn add_local(
        &mut self,
        id: ObjectId,
        motion: Motion,
        orientation: OrientationSample,
        bounds: Bounds,
        mesh: String,
    ) {
        self.records.insert(id, LocRecord { motion, orientation, bounds, mesh });
    }

    fn remove_local(&mut self, id: ObjectId) {
        self.records.remove(&id);
    }

    fn update_motion(&mut self, id: ObjectId, motion: Motion) {
        if let Some(rec) = self.records.get_mut(&id) {
            if motion.t >= rec.motion.t {
                rec.motion = motion;
            }
        }
    }

    fn motion(&self, id: ObjectId) -> Option<Motion> {
        self.records.get(&id).map(|r| r.motion)
    }

    fn orientation(&self, id: ObjectId) -> Option<OrientationSample> {
        self.records.get(&id).map(|r| r.orientation)
    }

    fn bounds(&self, id: ObjectId) -> Option<Bounds> {
        self.records.get(&id).map(|r| r.bounds)
    }

    fn mesh(&self, id: ObjectId) -> Option<String> {
        self.records.get(&id).map(|r| r.mesh.clone())
    }

    fn current_position(&self, id: ObjectId, at: u64) -> Option<Point3> {
        self.records.get(&id).map(|r| r.motion.extrapolate(at))
    }

    fn local_objects(&self) -> Vec<ObjectId> {
        self.records.keys().copied().collect()
    }
}
