use std::time::Instant;

use log::{debug, info, warn};

use loka_shared::{
    ConnectFields, ConnectKind, ConnectResponse, Datagram, MigrateRecord, Motion, ObjectId,
    OhMigrationKind, ServerId, ServerMessage, SessionId, SessionMessage,
};

use crate::cseg::{CoordSegmentation, SegmentationSnapshot};
use crate::error::ConnectRefusal;
use crate::exec::{mailbox, Inbox, Mailbox};
use crate::forwarder::{Forwarder, RouteCtx, RouteOutcome};
use crate::loc_service::LocationService;
use crate::migration::{MigrationManager, MigrationMonitor};
use crate::net::{ServerMessageQueue, SourceTag};
use crate::oseg::{AddStatus, DirResult, ObjectSegmentation, OsegEvent};
use crate::prox::{ProximityRelay, MIGRATION_TAG};
use crate::session::{SessionManager, SessionTransport};
use crate::telemetry::{Counters, CountersHandle};

/// Validates connect credentials. The real implementation is an external
/// collaborator; the default admits everyone.
pub trait Authenticator: Send {
    fn authenticate(&self, object: &ObjectId, auth: &[u8]) -> bool;
}

pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _object: &ObjectId, _auth: &[u8]) -> bool {
        true
    }
}

/// Everything the main executor reacts to, posted by the transports.
#[derive(Debug)]
pub enum MainEvent {
    SessionOpened(SessionId),
    SessionClosed(SessionId),
    SessionMessage(SessionId, SessionMessage),
    SessionDatagram(SessionId, Datagram),
    LocationUpdate { session: SessionId, object: ObjectId, motion: Motion },
    Stop,
}

/// One space server: the session gatekeeper, forwarder, migration state
/// machine, and the glue between coordinate segmentation, the object
/// directory, and the server message queue. Owned by the main executor and
/// driven by [`SpaceServer::tick`].
pub struct SpaceServer {
    id: ServerId,
    epoch: Instant,
    sim_base: u64,

    cseg: Box<dyn CoordSegmentation>,
    oseg: Box<dyn ObjectSegmentation>,
    smq: ServerMessageQueue,
    forwarder: Forwarder,
    sessions: SessionManager,
    migrations: MigrationManager,
    monitor: MigrationMonitor,
    loc: Box<dyn LocationService>,
    prox: ProximityRelay,
    auth: Box<dyn Authenticator>,

    events_rx: Inbox<MainEvent>,
    events_tx: Mailbox<MainEvent>,
    dir_rx: Inbox<DirResult>,
    seg_rx: Inbox<SegmentationSnapshot>,

    /// Migration acks that hit peer-queue backpressure, retried each tick.
    unsent_acks: Vec<(ServerId, ObjectId)>,

    counters: CountersHandle,
    stopping: bool,
}

pub struct SpaceServerConfig {
    pub id: ServerId,
    pub max_hops: u8,
    pub migration_timeout: std::time::Duration,
    pub migration_grace: std::time::Duration,
}

impl SpaceServer {
    /// Assemble a server from its collaborators. `dir_rx` is the inbox the
    /// directory pools post completions to.
    pub fn assemble(
        cfg: SpaceServerConfig,
        mut cseg: Box<dyn CoordSegmentation>,
        oseg: Box<dyn ObjectSegmentation>,
        smq: ServerMessageQueue,
        session_transport: Box<dyn SessionTransport>,
        loc: Box<dyn LocationService>,
        dir_rx: Inbox<DirResult>,
        counters: CountersHandle,
        epoch: Instant,
    ) -> Self {
        let (events_tx, events_rx) = mailbox();
        let (seg_tx, seg_rx) = mailbox();
        cseg.subscribe(seg_tx);
        let region = cseg.region_of(cfg.id);
        let sim_base = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            id: cfg.id,
            epoch,
            sim_base,
            cseg,
            oseg,
            smq,
            forwarder: Forwarder::new(cfg.id, cfg.max_hops, counters.clone()),
            sessions: SessionManager::new(session_transport),
            migrations: MigrationManager::new(cfg.migration_timeout, cfg.migration_grace),
            monitor: MigrationMonitor::new(region),
            loc,
            prox: ProximityRelay::new(),
            auth: Box::new(AllowAll),
            events_rx,
            events_tx,
            dir_rx,
            seg_rx,
            unsent_acks: Vec::new(),
            counters,
            stopping: false,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn set_authenticator(&mut self, auth: Box<dyn Authenticator>) {
        self.auth = auth;
    }

    /// Where transports post [`MainEvent`]s.
    pub fn mailbox(&self) -> Mailbox<MainEvent> {
        self.events_tx.clone()
    }

    /// Microseconds of simulation time at `now`.
    pub fn sim_time(&self, now: Instant) -> u64 {
        self.sim_base + now.duration_since(self.epoch).as_micros() as u64
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// True once shutdown may finish: no live migrations and nothing queued.
    pub fn drained(&self) -> bool {
        self.migrations.is_idle() && self.smq.pending() == 0 && self.unsent_acks.is_empty()
    }

    pub fn stop(&mut self) {
        info!("graceful stop requested; draining migrations and queues");
        self.stopping = true;
    }

    pub fn owned_objects(&self) -> usize {
        self.oseg.owned_count()
    }

    pub fn is_object_owned(&self, id: &ObjectId) -> bool {
        self.oseg.is_owned(id)
    }

    /// Diagnostic view of the directory's answer for an object.
    pub fn lookup_object(&mut self, id: &ObjectId, now: Instant) -> crate::oseg::LookupOutcome {
        self.oseg.lookup(id, now)
    }

    pub fn proximity(&mut self) -> &mut ProximityRelay {
        &mut self.prox
    }

    pub fn location(&mut self) -> &mut dyn LocationService {
        &mut *self.loc
    }

    /// One main-executor pass: drain inboxes, pump subsystems, service
    /// queues. Everything runs to completion; nothing blocks.
    pub fn tick(&mut self, now: Instant) {
        for event in self.events_rx.drain() {
            self.handle_event(event, now);
        }
        for result in self.dir_rx.drain() {
            self.oseg.handle_dir_result(result, now);
        }
        for snapshot in self.seg_rx.drain() {
            let region = snapshot.region_of(self.id);
            info!("segmentation changed; {} boxes assigned to this server", region.len());
            self.monitor.set_region(region);
        }

        self.cseg.service(now);
        self.oseg.service(now);
        self.process_oseg_events(now);

        // peer traffic
        while let Some((from, msg)) = self.smq.receive() {
            self.handle_server_message(from, msg, now);
            self.process_oseg_events(now);
        }

        // objects that wandered out of our region
        if !self.stopping {
            let owned: Vec<ObjectId> = self
                .loc
                .local_objects()
                .into_iter()
                .filter(|id| self.oseg.is_owned(id))
                .collect();
            for object in self.monitor.crossed(&*self.loc, &owned, self.sim_time(now)) {
                self.handle_migration_event(object, now);
            }
        }

        self.retry_migration_sends(now);
        self.sweep_migrations(now);

        // proximity notifications become ordinary datagrams
        for dg in self.prox.drain_datagrams(self.id) {
            self.route_datagram(dg, now);
        }

        // space-service messages (null destination)
        for dg in self.forwarder.take_service_messages() {
            debug!(
                "space service message from {} port {} ({} bytes)",
                dg.src_obj,
                dg.dst_port,
                dg.payload.len()
            );
        }

        self.sessions.service(now);
        self.smq.service(now);
        self.oseg.pump_directory();
    }

    fn handle_event(&mut self, event: MainEvent, now: Instant) {
        match event {
            MainEvent::SessionOpened(session) => self.sessions.open_session(session),
            MainEvent::SessionClosed(session) => self.handle_session_closed(session, now),
            MainEvent::SessionMessage(session, msg) => {
                self.handle_session_message(session, msg, now)
            }
            MainEvent::SessionDatagram(session, dg) => {
                self.handle_session_datagram(session, dg, now)
            }
            MainEvent::LocationUpdate { session, object, motion } => {
                if self.sessions.record_session(&object) == Some(session) {
                    self.loc.update_motion(object, motion);
                } else {
                    debug!("location update for {} from a foreign session; ignoring", object);
                }
            }
            MainEvent::Stop => self.stop(),
        }
    }

    // Session plane

    fn handle_session_message(&mut self, session: SessionId, msg: SessionMessage, now: Instant) {
        if !self.sessions.session_exists(session) {
            debug!("message on unknown session {:?}; ignoring", session);
            return;
        }
        match msg {
            SessionMessage::Connect { object, fields } => match fields.kind {
                ConnectKind::Fresh => self.handle_connect(session, object, fields, now),
                ConnectKind::Migration => self.handle_migrate_connect(session, object, fields, now),
            },
            SessionMessage::ConnectAck { object } => self.handle_connect_ack(object),
            SessionMessage::Disconnect { object, reason } => {
                self.handle_disconnect(session, object, &reason, now)
            }
            SessionMessage::OhMigration { object, kind } => {
                self.handle_oh_migration(session, object, kind, now)
            }
            SessionMessage::ConnectResponse { .. } | SessionMessage::InitMigration { .. } => {
                // server-to-host messages arriving from a host
                warn!("host sent a server-only session message; dropping");
                Counters::bump(&self.counters.protocol_violations);
            }
        }
    }

    /// Gatekeeper for `Connect{Fresh}`.
    fn handle_connect(
        &mut self,
        session: SessionId,
        object: ObjectId,
        fields: ConnectFields,
        now: Instant,
    ) {
        // connections always adopt local time; hosts resync from the
        // response rather than trusting their own clock here
        let local_t = self.sim_time(now);
        let mut fields = fields;
        fields.loc.t = local_t;
        fields.orientation.t = local_t;

        let curpos = fields.loc.position;
        let in_region = self.monitor.on_this_server(curpos);
        let loc_server = self.cseg.lookup(curpos);

        if loc_server.is_nil() {
            self.refuse(session, ConnectRefusal::OutsideWorld(object), now);
            return;
        }
        if loc_server == self.id && !in_region {
            self.refuse(session, ConnectRefusal::NotOurRegion(object), now);
            return;
        }

        if loc_server != self.id {
            // wrong server; tell the host where to go instead
            self.respond(session, object, ConnectResponse::Redirect { server: loc_server }, now);
            return;
        }

        if !self.auth.authenticate(&object, &fields.auth) {
            self.refuse(session, ConnectRefusal::AuthFailed(object), now);
            return;
        }

        // duplicate / conflict resolution
        if self.sessions.has_record(&object) {
            if self.sessions.record_session(&object) == Some(session) {
                // lost response; repeat it
                self.send_connect_success(session, object, now);
                return;
            }
            if !self.sessions.oh_migration_matches(&object, &fields.oh_name) {
                self.refuse(session, ConnectRefusal::Conflict(object), now);
                return;
            }
            // authorized host handoff falls through to re-registration
        } else if self.sessions.is_connecting(&object) {
            if self.sessions.connecting_session(&object) == Some(session) {
                // still working on the first attempt; neither success nor
                // failure is known yet, so say nothing
                return;
            }
            self.refuse(session, ConnectRefusal::Conflict(object), now);
            return;
        }

        self.sessions.set_oh_name(session, &fields.oh_name);
        let radius = fields.bounds.radius;
        self.sessions.store_connecting(object, session, fields);
        self.oseg.add_new(object, radius, now);
    }

    /// The directory write behind `add_new` finished; finalize the session.
    fn finish_add_object(&mut self, object: ObjectId, status: AddStatus, now: Instant) {
        let Some(stored) = self.sessions.take_connecting(&object) else {
            warn!("no stored connection data for {}", object);
            return;
        };

        let handoff = self.sessions.has_record(&object)
            && self.sessions.record_session(&object) != Some(stored.session);
        let old_session = self.sessions.record_session(&object);

        self.sessions.add_connection(object, stored.session);

        if handoff {
            // same object, new host: drop the old binding politely
            if let Some(old) = old_session {
                self.sessions.send_with_retry(
                    old,
                    SessionMessage::Disconnect {
                        object,
                        reason: "object host migration".to_string(),
                    },
                    now,
                );
            }
            self.sessions.clear_oh_migration(&object);
            info!("object {} handed off to a new host session", object);
        } else if status == AddStatus::Success {
            self.loc.add_local(
                object,
                stored.fields.loc,
                stored.fields.orientation,
                stored.fields.bounds,
                stored.fields.mesh.clone(),
            );
            if stored.fields.query_radius > 0.0 {
                self.prox.add_query(object, stored.fields.query_radius);
            }
            info!("new object {} connected", object);
        }

        self.send_connect_success(stored.session, object, now);
    }

    fn send_connect_success(&mut self, session: SessionId, object: ObjectId, now: Instant) {
        let response = ConnectResponse::Success {
            loc: self.loc.motion(object).unwrap_or_default(),
            orientation: self.loc.orientation(object).unwrap_or_default(),
            bounds: self.loc.bounds(object).unwrap_or_default(),
            mesh: self.loc.mesh(object).unwrap_or_default(),
        };
        self.respond(session, object, response, now);
    }

    fn respond(
        &mut self,
        session: SessionId,
        object: ObjectId,
        response: ConnectResponse,
        now: Instant,
    ) {
        self.sessions.send_with_retry(
            session,
            SessionMessage::ConnectResponse { object, response },
            now,
        );
    }

    /// The refusal detail stays in the log; hosts only ever see `Error`.
    fn refuse(&mut self, session: SessionId, refusal: ConnectRefusal, now: Instant) {
        let object = match &refusal {
            ConnectRefusal::OutsideWorld(o)
            | ConnectRefusal::NotOurRegion(o)
            | ConnectRefusal::Conflict(o)
            | ConnectRefusal::AuthFailed(o) => *o,
        };
        warn!("refusing connect: {}", refusal);
        self.respond(session, object, ConnectResponse::Error, now);
    }

    fn handle_connect_ack(&mut self, object: ObjectId) {
        self.sessions.enable(&object);
    }

    fn handle_disconnect(
        &mut self,
        session: SessionId,
        object: ObjectId,
        reason: &str,
        now: Instant,
    ) {
        if self.sessions.take_connecting(&object).is_some() {
            debug!("connect attempt for {} withdrawn ({})", object, reason);
            return;
        }
        if self.sessions.record_session(&object) != Some(session) {
            debug!("disconnect for {} from a session that does not hold it", object);
            return;
        }
        info!("object {} disconnected ({})", object, reason);
        self.teardown_object(object, now);
    }

    fn handle_session_closed(&mut self, session: SessionId, now: Instant) {
        for object in self.sessions.close_session(session) {
            if self.migrations.is_migrating_out(&object) {
                // the host vanished mid-migration: let the hand-over finish,
                // the destination may still pick the host back up
                debug!("session closed while {} migrates out; migration continues", object);
                continue;
            }
            self.teardown_object(object, now);
        }
    }

    /// Remove every local trace of an object and tombstone it upstream.
    fn teardown_object(&mut self, object: ObjectId, now: Instant) {
        self.oseg.remove(&object, now);
        self.loc.remove_local(object);
        self.prox.remove_query(&object);
        self.sessions.remove_connection(&object);
        self.smq.clear_source(&SourceTag::Object(object));
        self.process_oseg_events(now);
    }

    fn handle_oh_migration(
        &mut self,
        session: SessionId,
        object: ObjectId,
        kind: OhMigrationKind,
        now: Instant,
    ) {
        match kind {
            OhMigrationKind::Object => {
                let Some(name) = self.sessions.oh_name(session).map(str::to_string) else {
                    warn!("host migration request on anonymous session; refusing");
                    return;
                };
                self.sessions.authorize_oh_migration(object, name);
                self.sessions.send_with_retry(
                    session,
                    SessionMessage::OhMigration { object, kind: OhMigrationKind::Ack },
                    now,
                );
            }
            OhMigrationKind::Entity => {
                self.sessions.send_with_retry(
                    session,
                    SessionMessage::OhMigration { object, kind: OhMigrationKind::Ack },
                    now,
                );
            }
            OhMigrationKind::Ack => {
                debug!("unexpected OH migration ack from host; ignoring");
            }
        }
    }

    fn handle_session_datagram(&mut self, session: SessionId, mut dg: Datagram, now: Instant) {
        // forwarding preserves source identity: a session may only emit
        // datagrams from objects it actually holds
        if self.sessions.record_session(&dg.src_obj) != Some(session) {
            warn!("session {:?} tried to send as {}; dropping", session, dg.src_obj);
            Counters::bump(&self.counters.protocol_violations);
            return;
        }
        dg.src_server = self.id;
        dg.hops = 0;
        self.route_datagram(dg, now);
    }

    fn route_datagram(&mut self, dg: Datagram, now: Instant) {
        let mut ctx = RouteCtx {
            oseg: &mut *self.oseg,
            smq: &mut self.smq,
            sessions: &mut self.sessions,
            migrations: &mut self.migrations,
            now,
        };
        if let RouteOutcome::Backpressure = self.forwarder.route(dg, &mut ctx) {
            // datagrams are best-effort; the producer sees backpressure
            // through its own send path, here we shed
            Counters::bump(&self.counters.datagrams_dropped);
        }
    }

    // Server plane

    fn handle_server_message(&mut self, from: ServerId, msg: ServerMessage, now: Instant) {
        match msg {
            ServerMessage::ObjectDatagram(dg) => self.route_datagram(dg, now),
            ServerMessage::MigratePayload(record) => {
                debug!(
                    "migrate payload for {} from {} arrived",
                    record.object, record.src_server
                );
                let object = record.object;
                self.migrations.store_payload(record, now);
                self.handle_migration(object, now);
            }
            ServerMessage::MigrationAck { from: ack_from, to, object } => {
                if to != self.id {
                    // mis-delivered; pass it along rather than lose it
                    let fwd = ServerMessage::MigrationAck { from: ack_from, to, object };
                    if !self.smq.push(to, SourceTag::Control, fwd, now) {
                        warn!("cannot forward misrouted migration ack for {}", object);
                    }
                    return;
                }
                self.oseg.handle_migration_ack(ack_from, object, now);
            }
            ServerMessage::DirectoryUpdate { object, owner } => {
                self.oseg.handle_directory_update(object, owner, now);
            }
            ServerMessage::KillObjectConnection { object } => {
                self.kill_object_connection(object, now);
            }
        }
        let _ = from;
    }

    // Migration: source side

    fn handle_migration_event(&mut self, object: ObjectId, now: Instant) {
        if !self.oseg.clear_to_migrate(&object) || !self.oseg.is_owned(&object) {
            return;
        }
        let Some(session) = self.sessions.record_session(&object) else {
            return;
        };
        let at = self.sim_time(now);
        let Some(pos) = self.loc.current_position(object, at) else {
            return;
        };
        let new_server = self.cseg.lookup(pos);
        if new_server == self.id || new_server.is_nil() {
            // trust segmentation to have the final say; nothing to do
            return;
        }

        info!("starting migration of {} from {} to {}", object, self.id, new_server);
        Counters::bump(&self.counters.migrations_started);

        // the host learns where to reconnect
        self.sessions.send_with_retry(
            session,
            SessionMessage::InitMigration { object, new_server },
            now,
        );

        let motion = self.loc.motion(object).unwrap_or_default();
        let orientation = self.loc.orientation(object).unwrap_or_default();
        let bounds = self.loc.bounds(object).unwrap_or_default();
        let mesh = self.loc.mesh(object).unwrap_or_default();

        self.oseg.migrate_out(&object, new_server, now);
        let conn_token = self.sessions.record_token(&object).unwrap_or(0);
        self.migrations.begin_outgoing(object, new_server, conn_token, now);

        let mut client_data = Vec::new();
        let prox_data = self.prox.generate_migration_data(&object);
        if !prox_data.is_empty() {
            client_data.push((MIGRATION_TAG.to_string(), prox_data));
        }
        let record = MigrateRecord {
            src_server: self.id,
            object,
            motion,
            orientation,
            bounds,
            mesh,
            client_data,
        };
        if !self.smq.push(
            new_server,
            SourceTag::Control,
            ServerMessage::MigratePayload(record.clone()),
            now,
        ) {
            self.migrations.queue_payload(new_server, record);
        }

        // simulation state leaves with the payload
        self.loc.remove_local(object);
    }

    /// Retry payload and ack sends that previously hit backpressure.
    fn retry_migration_sends(&mut self, now: Instant) {
        let mut unsent = self.migrations.take_unsent_payloads();
        while let Some((to, record)) = unsent.pop_front() {
            if !self.smq.push(
                to,
                SourceTag::Control,
                ServerMessage::MigratePayload(record.clone()),
                now,
            ) {
                self.migrations.queue_payload(to, record);
            }
        }

        let pending: Vec<(ServerId, ObjectId)> = self.unsent_acks.drain(..).collect();
        for (to, object) in pending {
            self.send_migration_ack(to, object, now);
        }
    }

    fn sweep_migrations(&mut self, now: Instant) {
        let (expired, tombstones, refused) = self.migrations.sweep(now);
        for (object, record) in expired {
            // best-effort: whatever was buffered can still try to route
            if self.sessions.record_token(&object) == Some(record.conn_token) {
                self.sessions.remove_connection(&object);
            }
            for dg in record.pending_forward {
                self.route_datagram(dg, now);
            }
        }
        for (object, src_server) in tombstones {
            let update = ServerMessage::DirectoryUpdate { object, owner: ServerId::NIL };
            if !self.smq.push(src_server, SourceTag::Control, update, now) {
                debug!("tombstone for {} hit backpressure; dropping", object);
            }
        }
        for (object, session) in refused {
            self.respond(session, object, ConnectResponse::Error, now);
        }
    }

    // Migration: destination side

    fn handle_migrate_connect(
        &mut self,
        session: SessionId,
        object: ObjectId,
        fields: ConnectFields,
        now: Instant,
    ) {
        debug!("host connect for migrating object {}", object);
        self.sessions.set_oh_name(session, &fields.oh_name);
        self.migrations.store_host_connect(object, session, now);
        self.handle_migration(object, now);
    }

    /// Runs whenever either half of the destination rendezvous arrives;
    /// completes the install once both the payload and the host are here.
    fn handle_migration(&mut self, object: ObjectId, now: Instant) {
        let re_migrating = self.migrations.is_migrating_out(&object);
        let Some((record, session)) = self.migrations.take_rendezvous(&object) else {
            return;
        };

        info!("finishing migration of {} onto {}", object, self.id);

        if re_migrating {
            // the object is coming home before its old departure record was
            // cleaned up: retire that record now and keep its buffered
            // traffic for replay after install
            if let Some(old) = self.migrations.finish_outgoing(&object) {
                self.sessions.remove_connection(&object);
                self.migrations.begin_install(object);
                for dg in old.pending_forward {
                    self.migrations.buffer_if_migrating(&object, dg);
                }
            }
        } else {
            self.migrations.begin_install(object);
        }

        self.loc.add_local(
            object,
            record.motion,
            record.orientation,
            record.bounds,
            record.mesh.clone(),
        );
        for (tag, data) in &record.client_data {
            if tag == MIGRATION_TAG {
                self.prox.receive_migration_data(object, data);
            } else {
                warn!("unknown migration client data tag `{}` for {}", tag, object);
            }
        }

        self.sessions.add_connection(object, session);
        self.oseg.accept_migration(
            object,
            record.bounds.radius,
            record.src_server,
            true,
            now,
        );

        // success goes back before the ack write lands; delivery stays
        // parked until the host acks
        self.send_connect_success(session, object, now);
    }

    fn send_migration_ack(&mut self, to: ServerId, object: ObjectId, now: Instant) {
        let ack = ServerMessage::MigrationAck { from: self.id, to, object };
        if !self.smq.push(to, SourceTag::Control, ack, now) {
            self.unsent_acks.push((to, object));
        }
    }

    /// Ack-driven cleanup on the old owner, routed through the loopback so
    /// it serializes behind everything already queued.
    fn kill_object_connection(&mut self, object: ObjectId, now: Instant) {
        let Some(record) = self.migrations.finish_outgoing(&object) else {
            debug!("kill for {} with no migration record; already cleaned up", object);
            return;
        };
        if self.sessions.record_token(&object) == Some(record.conn_token) {
            self.sessions.remove_connection(&object);
        } else {
            info!("object {} re-migrated here; keeping its new binding", object);
        }
        Counters::bump(&self.counters.migrations_completed);
        info!(
            "migration of {} to {} complete; replaying {} buffered datagrams",
            object,
            record.to,
            record.pending_forward.len()
        );
        for dg in record.pending_forward {
            // FIFO replay; routing now resolves to the new owner via cache
            self.route_datagram(dg, now);
        }
    }

    // OSEG events

    fn process_oseg_events(&mut self, now: Instant) {
        for event in self.oseg.take_events() {
            match event {
                OsegEvent::LookupComplete { object, server } => {
                    let mut ctx = RouteCtx {
                        oseg: &mut *self.oseg,
                        smq: &mut self.smq,
                        sessions: &mut self.sessions,
                        migrations: &mut self.migrations,
                        now,
                    };
                    self.forwarder.release_held(&object, &mut ctx);
                    let _ = server;
                }
                OsegEvent::AddFinished { object, status } => {
                    self.finish_add_object(object, status, now);
                }
                OsegEvent::SendAck { to, object } => {
                    self.send_migration_ack(to, object, now);
                    // the install window closes with the directory write
                    for dg in self.migrations.finish_install(&object) {
                        self.route_datagram(dg, now);
                    }
                }
                OsegEvent::AckProcessed { object, new_owner } => {
                    debug!("{} now owned by {}; scheduling local cleanup", object, new_owner);
                    let kill = ServerMessage::KillObjectConnection { object };
                    if !self.smq.push(self.id, SourceTag::Control, kill, now) {
                        // loopback full; clean up directly instead
                        self.kill_object_connection(object, now);
                    }
                }
                OsegEvent::Tombstone { object } => {
                    let peers = self.cseg.num_servers();
                    for peer in 1..=peers {
                        let peer = ServerId(peer);
                        if peer == self.id {
                            continue;
                        }
                        let update =
                            ServerMessage::DirectoryUpdate { object, owner: ServerId::NIL };
                        if !self.smq.push(peer, SourceTag::Control, update, now) {
                            debug!("tombstone broadcast to {} hit backpressure", peer);
                        }
                    }
                }
            }
        }
    }
}
