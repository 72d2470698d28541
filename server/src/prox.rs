use std::collections::{HashMap, VecDeque};

use log::warn;

use loka_shared::{Datagram, Motion, ObjectId, Port, ServerId, WireReader, WireWriter};

/// Substream port proximity notifications are delivered on.
pub const PORT_PROXIMITY: Port = 2;

/// Tag under which query state travels inside a migrate payload.
pub const MIGRATION_TAG: &str = "prox";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxEventKind {
    Entered,
    Exited,
}

/// One neighbor entering or leaving a query's result set.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxEvent {
    pub query: ObjectId,
    pub neighbor: ObjectId,
    pub kind: ProxEventKind,
    pub loc: Motion,
}

impl ProxEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(49);
        w.u8(match self.kind {
            ProxEventKind::Entered => 1,
            ProxEventKind::Exited => 2,
        });
        w.object_id(&self.neighbor);
        w.motion(&self.loc);
        w.into_bytes()
    }

    pub fn decode(query: ObjectId, body: &[u8]) -> Option<Self> {
        let mut r = WireReader::new(body);
        let kind = match r.u8().ok()? {
            1 => ProxEventKind::Entered,
            2 => ProxEventKind::Exited,
            _ => return None,
        };
        let neighbor = r.object_id().ok()?;
        let loc = r.motion().ok()?;
        Some(ProxEvent { query, neighbor, kind, loc })
    }
}

/// Bridge between the external proximity engine and the datagram plane:
/// registered queries, a buffered event queue, and the packing of query
/// state into migrate payloads. Result batches always carry additions *and*
/// removals; both become events.
pub struct ProximityRelay {
    queries: HashMap<ObjectId, f32>,
    events: VecDeque<ProxEvent>,
}

impl ProximityRelay {
    pub fn new() -> Self {
        Self { queries: HashMap::new(), events: VecDeque::new() }
    }

    pub fn add_query(&mut self, object: ObjectId, radius: f32) {
        if radius > 0.0 {
            self.queries.insert(object, radius);
        }
    }

    pub fn remove_query(&mut self, object: &ObjectId) {
        self.queries.remove(object);
    }

    pub fn query_radius(&self, object: &ObjectId) -> Option<f32> {
        self.queries.get(object).copied()
    }

    /// One evaluation round from the engine: neighbors that entered and
    /// neighbors that left, in that order within the batch.
    pub fn ingest_results(
        &mut self,
        query: ObjectId,
        additions: Vec<(ObjectId, Motion)>,
        removals: Vec<(ObjectId, Motion)>,
    ) {
        if !self.queries.contains_key(&query) {
            warn!("proximity results for unregistered query {}; ignoring", query);
            return;
        }
        for (neighbor, loc) in additions {
            self.events.push_back(ProxEvent {
                query,
                neighbor,
                kind: ProxEventKind::Entered,
                loc,
            });
        }
        for (neighbor, loc) in removals {
            self.events.push_back(ProxEvent {
                query,
                neighbor,
                kind: ProxEventKind::Exited,
                loc,
            });
        }
    }

    /// Turn buffered events into datagrams addressed to the querying
    /// objects. Emitted by this space service, so the source object is null.
    pub fn drain_datagrams(&mut self, self_server: ServerId) -> Vec<Datagram> {
        self.events
            .drain(..)
            .map(|event| Datagram {
                src_server: self_server,
                hops: 0,
                src_obj: ObjectId::NULL,
                dst_obj: event.query,
                src_port: PORT_PROXIMITY,
                dst_port: PORT_PROXIMITY,
                payload: event.encode(),
            })
            .collect()
    }

    /// Wrap this object's query state for a migrate payload. Empty when the
    /// object has no query.
    pub fn generate_migration_data(&mut self, object: &ObjectId) -> Vec<u8> {
        match self.queries.remove(object) {
            Some(radius) => radius.to_le_bytes().to_vec(),
            None => Vec::new(),
        }
    }

    /// Install query state carried by a migrate payload.
    pub fn receive_migration_data(&mut self, object: ObjectId, data: &[u8]) {
        if data.len() == 4 {
            let radius = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            self.add_query(object, radius);
        } else if !data.is_empty() {
            warn!("malformed proximity migration data for {}; ignoring", object);
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl Default for ProximityRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loka_shared::{Point3, Vec3};

    fn motion() -> Motion {
        Motion::new(5, Point3::new(1.0, 2.0, 3.0), Vec3::ZERO)
    }

    #[test]
    fn emits_both_additions_and_removals() {
        let mut relay = ProximityRelay::new();
        let query = ObjectId([1; 16]);
        relay.add_query(query, 50.0);
        relay.ingest_results(
            query,
            vec![(ObjectId([2; 16]), motion())],
            vec![(ObjectId([3; 16]), motion())],
        );
        let datagrams = relay.drain_datagrams(ServerId(1));
        assert_eq!(datagrams.len(), 2);
        let first = ProxEvent::decode(query, &datagrams[0].payload).unwrap();
        let second = ProxEvent::decode(query, &datagrams[1].payload).unwrap();
        assert_eq!(first.kind, ProxEventKind::Entered);
        assert_eq!(first.neighbor, ObjectId([2; 16]));
        assert_eq!(second.kind, ProxEventKind::Exited);
        assert_eq!(second.neighbor, ObjectId([3; 16]));
        // events come from the space service, not a session object
        assert!(datagrams[0].src_obj.is_null());
    }

    #[test]
    fn query_state_round_trips_through_migration() {
        let mut relay = ProximityRelay::new();
        let object = ObjectId([4; 16]);
        relay.add_query(object, 100.0);
        let data = relay.generate_migration_data(&object);
        assert!(relay.query_radius(&object).is_none());

        let mut other = ProximityRelay::new();
        other.receive_migration_data(object, &data);
        assert_eq!(other.query_radius(&object), Some(100.0));
    }

    #[test]
    fn results_for_unknown_queries_are_dropped() {
        let mut relay = ProximityRelay::new();
        relay.ingest_results(ObjectId([9; 16]), vec![(ObjectId([2; 16]), motion())], vec![]);
        assert_eq!(relay.pending_events(), 0);
    }
}
