use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, warn};

use loka_shared::{Datagram, ObjectId, ServerId, ServerMessage};

use crate::migration::MigrationManager;
use crate::net::{ServerMessageQueue, SourceTag};
use crate::oseg::{LookupOutcome, ObjectSegmentation};
use crate::session::{DeliverOutcome, SessionManager};
use crate::telemetry::{Counters, CountersHandle};

/// Everything `route` touches, borrowed from the owning server for the span
/// of one call.
pub struct RouteCtx<'a> {
    pub oseg: &'a mut dyn ObjectSegmentation,
    pub smq: &'a mut ServerMessageQueue,
    pub sessions: &'a mut SessionManager,
    pub migrations: &'a mut MigrationManager,
    pub now: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to a local session (possibly parked pre-ack).
    Delivered,
    /// Queued toward a peer server.
    Forwarded,
    /// Parked in a migration record's forward queue.
    Buffered,
    /// Parked awaiting an OSEG lookup.
    Held,
    /// Dispatched to a space service (null destination).
    Service,
    /// Dropped: hop limit, missing record, or similar. Logged.
    Dropped,
    /// The peer queue refused it; the caller sheds or retries.
    Backpressure,
}

const HELD_PER_OBJECT_LIMIT: usize = 1024;

/// Routes datagrams across the three tiers: local session delivery, peer
/// forwarding, and space-service dispatch; holds traffic whose destination
/// is mid-lookup or mid-migration.
pub struct Forwarder {
    id: ServerId,
    max_hops: u8,
    /// Datagrams awaiting an asynchronous directory lookup, per destination.
    held: HashMap<ObjectId, VecDeque<Datagram>>,
    /// Null-destination datagrams for local space services.
    service_inbox: Vec<Datagram>,
    counters: CountersHandle,
}

impl Forwarder {
    pub fn new(id: ServerId, max_hops: u8, counters: CountersHandle) -> Self {
        Self {
            id,
            max_hops,
            held: HashMap::new(),
            service_inbox: Vec::new(),
            counters,
        }
    }

    /// Route one datagram. See the outcome enum for what the caller may need
    /// to do; only `Backpressure` requires action.
    pub fn route(&mut self, dg: Datagram, ctx: &mut RouteCtx) -> RouteOutcome {
        // the null object is the space itself
        if dg.dst_obj.is_null() {
            self.service_inbox.push(dg);
            return RouteOutcome::Service;
        }

        let dst = dg.dst_obj;

        // locally simulated and bound to a session: deliver (the record
        // itself parks pre-ack traffic)
        if ctx.oseg.is_owned(&dst) && ctx.sessions.has_record(&dst) {
            match ctx.sessions.deliver(&dst, dg) {
                DeliverOutcome::Delivered => {
                    Counters::bump(&self.counters.datagrams_delivered);
                    return RouteOutcome::Delivered;
                }
                DeliverOutcome::NoRecord => unreachable!("has_record checked above"),
            }
        }

        // mid-migration here (either side): park on the migration record and
        // replay in order once it resolves
        if ctx.migrations.buffer_if_migrating(&dst, dg.clone()) {
            return RouteOutcome::Buffered;
        }

        match ctx.oseg.lookup(&dst, ctx.now) {
            LookupOutcome::Local => {
                // owned but no session binding: transient (session just
                // closed or teardown racing); drop rather than loop
                match ctx.sessions.deliver(&dst, dg) {
                    DeliverOutcome::Delivered => {
                        Counters::bump(&self.counters.datagrams_delivered);
                        RouteOutcome::Delivered
                    }
                    DeliverOutcome::NoRecord => {
                        warn!("datagram for local {} with no session record; dropping", dst);
                        Counters::bump(&self.counters.datagrams_dropped);
                        RouteOutcome::Dropped
                    }
                }
            }
            LookupOutcome::Remote(peer) => self.forward(dg, peer, ctx),
            LookupOutcome::Pending => {
                let queue = self.held.entry(dst).or_default();
                if queue.len() >= HELD_PER_OBJECT_LIMIT {
                    warn!("lookup hold queue for {} full; dropping oldest", dst);
                    queue.pop_front();
                    Counters::bump(&self.counters.datagrams_dropped);
                }
                queue.push_back(dg);
                RouteOutcome::Held
            }
        }
    }

    fn forward(&mut self, mut dg: Datagram, peer: ServerId, ctx: &mut RouteCtx) -> RouteOutcome {
        if peer == self.id {
            // stale cache pointing back at ourselves; the owned check
            // already said no, so this would ping-pong forever
            warn!("lookup for {} resolved to self without ownership; dropping", dg.dst_obj);
            Counters::bump(&self.counters.datagrams_dropped);
            return RouteOutcome::Dropped;
        }
        if dg.hops >= self.max_hops {
            debug!(
                "datagram {} -> {} exceeded {} hops; dropping",
                dg.src_obj, dg.dst_obj, self.max_hops
            );
            Counters::bump(&self.counters.hop_limit_drops);
            Counters::bump(&self.counters.datagrams_dropped);
            return RouteOutcome::Dropped;
        }
        dg.hops += 1;
        let tag = SourceTag::Object(dg.src_obj);
        if ctx.smq.push(peer, tag, ServerMessage::ObjectDatagram(dg), ctx.now) {
            Counters::bump(&self.counters.datagrams_forwarded);
            RouteOutcome::Forwarded
        } else {
            RouteOutcome::Backpressure
        }
    }

    /// An OSEG lookup resolved: replay everything held for `object` through
    /// the normal path (FIFO, so per-pair order is preserved).
    pub fn release_held(&mut self, object: &ObjectId, ctx: &mut RouteCtx) {
        let Some(queue) = self.held.remove(object) else {
            return;
        };
        debug!("releasing {} held datagrams for {}", queue.len(), object);
        for dg in queue {
            if let RouteOutcome::Backpressure = self.route(dg, ctx) {
                // peer queue full: shed the remainder of the burst
                Counters::bump(&self.counters.datagrams_dropped);
            }
        }
    }

    /// Messages addressed to the space itself, for service dispatch.
    pub fn take_service_messages(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.service_inbox)
    }

    pub fn held_count(&self) -> usize {
        self.held.values().map(|q| q.len()).sum()
    }
}
