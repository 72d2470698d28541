//! In-process cluster harness: several `SpaceServer`s wired through a
//! deterministic message ferry instead of real sockets, sharing one
//! in-memory directory, with a scripted object host that follows redirects
//! and migration handoffs the way a real host library would.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use loka_server::config::SmqKind;
use loka_server::cseg::UniformSegmentation;
use loka_server::exec::{bounded_mailbox, mailbox, BoundedMailbox, Inbox, Mailbox};
use loka_server::net::{NetCmd, ServerMessageQueue};
use loka_server::oseg::{CraqSegmentation, DirectoryPool, MemoryStore};
use loka_server::session::SessionTransport;
use loka_server::space::{MainEvent, SpaceServer, SpaceServerConfig};
use loka_server::telemetry::Counters;
use loka_shared::{
    Aabb, Bounds, ConnectFields, ConnectKind, ConnectResponse, Datagram, Motion, ObjectId,
    OrientationSample, Point3, Quat, ServerId, ServerMessage, SessionId, SessionMessage, Vec3,
};

/// Everything a server "sent" to its hosts, captured for assertions.
#[derive(Default)]
pub struct HostOutbox {
    pub messages: Vec<(SessionId, SessionMessage)>,
    pub datagrams: Vec<(SessionId, Datagram)>,
}

#[derive(Clone, Default)]
pub struct ProbeTransport {
    pub outbox: Arc<Mutex<HostOutbox>>,
}

impl SessionTransport for ProbeTransport {
    fn send(&mut self, session: SessionId, msg: &SessionMessage) -> bool {
        self.outbox.lock().unwrap().messages.push((session, msg.clone()));
        true
    }

    fn deliver_datagram(&mut self, session: SessionId, datagram: &Datagram) -> bool {
        self.outbox.lock().unwrap().datagrams.push((session, datagram.clone()));
        true
    }
}

pub struct TestServer {
    pub server: SpaceServer,
    pub events: Mailbox<MainEvent>,
    pub outbox: Arc<Mutex<HostOutbox>>,
    net_rx: Inbox<NetCmd>,
    inbound_tx: BoundedMailbox<(ServerId, ServerMessage)>,
}

pub struct Cluster {
    pub servers: Vec<TestServer>,
    pub store: MemoryStore,
    /// Every inter-server message the ferry moved, in order.
    pub wire_log: Vec<(ServerId, ServerId, ServerMessage)>,
    pub now: Instant,
    hosts: Vec<HostSim>,
}

/// A scripted object host: connects, follows redirects, completes migration
/// handoffs, and acks successes, mirroring the session protocol.
struct HostSim {
    object: ObjectId,
    oh_name: String,
    fields: ConnectFields,
    /// Index of the server the host currently talks to.
    at: usize,
    session: SessionId,
    pub connected: bool,
    responses: Vec<ConnectResponse>,
}

static NEXT_SESSION: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);

fn fresh_session() -> SessionId {
    SessionId(NEXT_SESSION.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

pub fn oid(seed: u8) -> ObjectId {
    ObjectId([seed; 16])
}

pub fn motion(pos: Point3, vel: Vec3) -> Motion {
    Motion::new(0, pos, vel)
}

pub fn connect_fields(pos: Point3, vel: Vec3, radius: f32, oh_name: &str) -> ConnectFields {
    ConnectFields {
        kind: ConnectKind::Fresh,
        loc: motion(pos, vel),
        orientation: OrientationSample::new(0, Quat::IDENTITY, Quat::IDENTITY),
        bounds: Bounds::new(pos, radius),
        mesh: String::new(),
        physics: Vec::new(),
        query_radius: 0.0,
        auth: Vec::new(),
        oh_name: oh_name.to_string(),
    }
}

impl Cluster {
    /// `perdim` uniform grid over `world`; one server per cell, ids 1..=n.
    pub fn new(world: Aabb, perdim: (u32, u32, u32)) -> Self {
        Self::with_grace(world, perdim, Duration::from_secs(60))
    }

    /// Same, with a custom migration grace timeout (the destination-side
    /// abandonment tests shrink it to something a test can wait out).
    pub fn with_grace(world: Aabb, perdim: (u32, u32, u32), grace: Duration) -> Self {
        let store = MemoryStore::new();
        let n = perdim.0 * perdim.1 * perdim.2;
        let mut servers = Vec::new();
        for raw_id in 1..=n {
            let id = ServerId(raw_id);
            let counters = Counters::new_handle();
            let (dir_tx, dir_rx) = mailbox();
            let get_pool = DirectoryPool::inline(Box::new(store.clone()), dir_tx.clone());
            let set_pool = DirectoryPool::inline(Box::new(store.clone()), dir_tx.clone());
            let mut oseg = CraqSegmentation::new(
                id,
                b'T',
                200,
                Duration::from_secs(8),
                512,
                get_pool,
                set_pool,
                counters.clone(),
            );
            oseg.set_not_found_sit_out(Duration::from_millis(500));

            let (net_tx, net_rx) = mailbox();
            let (inbound_tx, inbound_rx) = bounded_mailbox(256);
            let smq = ServerMessageQueue::new(
                id,
                SmqKind::Fair,
                256,
                10_000_000,
                net_tx,
                inbound_rx,
                counters.clone(),
            );

            let transport = ProbeTransport::default();
            let outbox = transport.outbox.clone();
            let server = SpaceServer::assemble(
                SpaceServerConfig {
                    id,
                    max_hops: 3,
                    migration_timeout: Duration::from_secs(30),
                    migration_grace: grace,
                },
                Box::new(UniformSegmentation::new(world, perdim)),
                Box::new(oseg),
                smq,
                Box::new(transport),
                Box::new(loka_server::loc_service::StandardLocationService::new()),
                dir_rx,
                counters,
                Instant::now(),
            );
            let events = server.mailbox();
            servers.push(TestServer { server, events, outbox, net_rx, inbound_tx });
        }
        Cluster {
            servers,
            store,
            wire_log: Vec::new(),
            now: Instant::now(),
            hosts: Vec::new(),
        }
    }

    fn index_of(&self, id: ServerId) -> usize {
        (id.0 - 1) as usize
    }

    /// Tick every server once, then ferry queued inter-server frames.
    pub fn step(&mut self) {
        self.now += Duration::from_millis(10);
        for s in &mut self.servers {
            s.server.tick(self.now);
        }
        // ferry: what each server's SMQ handed to "the network" lands in the
        // destination's inbound queue, order preserved
        let mut moved = Vec::new();
        for (idx, s) in self.servers.iter().enumerate() {
            let from = ServerId(idx as u32 + 1);
            for cmd in s.net_rx.drain() {
                if let NetCmd::SendTo { peer, frame } = cmd {
                    let msg = ServerMessage::decode(&frame[4..]).expect("ferry decode");
                    moved.push((from, peer, msg));
                }
            }
        }
        for (from, to, msg) in moved {
            let to_idx = self.index_of(to);
            assert!(
                self.servers[to_idx].inbound_tx.try_post((from, msg.clone())),
                "test inbound queue overflow"
            );
            self.wire_log.push((from, to, msg));
        }
        self.drive_hosts();
    }

    /// Run until nothing moved on the wire for a few consecutive steps.
    pub fn settle(&mut self) {
        let mut quiet = 0;
        for _ in 0..200 {
            let before = self.wire_log.len();
            self.step();
            if self.wire_log.len() == before {
                quiet += 1;
                if quiet >= 3 {
                    return;
                }
            } else {
                quiet = 0;
            }
        }
        panic!("cluster never settled");
    }

    pub fn post(&self, server: ServerId, event: MainEvent) {
        let idx = self.index_of(server);
        assert!(self.servers[idx].events.post(event));
    }

    pub fn server(&mut self, id: ServerId) -> &mut SpaceServer {
        let idx = self.index_of(id);
        &mut self.servers[idx].server
    }

    /// Raw view of everything a server sent to its hosts.
    pub fn outbox(&self, id: ServerId) -> Arc<Mutex<HostOutbox>> {
        self.servers[self.index_of(id)].outbox.clone()
    }

    /// Open a bare session (no scripted host behind it).
    pub fn open_session(&mut self, server: ServerId) -> SessionId {
        let session = fresh_session();
        self.post(server, MainEvent::SessionOpened(session));
        session
    }

    /// Inject a message as if peer `from` had sent it over the wire.
    pub fn inject(&mut self, from: ServerId, to: ServerId, msg: ServerMessage) {
        let idx = self.index_of(to);
        assert!(self.servers[idx].inbound_tx.try_post((from, msg)));
    }

    /// Start a scripted host for `object`, dialing `first` with `fields`.
    /// Returns the host's index for later queries.
    pub fn spawn_host(&mut self, object: ObjectId, first: ServerId, fields: ConnectFields) -> usize {
        let at = self.index_of(first);
        let session = fresh_session();
        self.post(first, MainEvent::SessionOpened(session));
        self.post(
            first,
            MainEvent::SessionMessage(
                session,
                SessionMessage::Connect { object, fields: fields.clone() },
            ),
        );
        self.hosts.push(HostSim {
            object,
            oh_name: fields.oh_name.clone(),
            fields,
            at,
            session,
            connected: false,
            responses: Vec::new(),
        });
        self.hosts.len() - 1
    }

    pub fn host_connected(&self, host: usize) -> bool {
        self.hosts[host].connected
    }

    pub fn host_responses(&self, host: usize) -> Vec<ConnectResponse> {
        self.hosts[host].responses.clone()
    }

    pub fn host_session(&self, host: usize) -> (ServerId, SessionId) {
        let h = &self.hosts[host];
        (ServerId(h.at as u32 + 1), h.session)
    }

    /// Have the host disconnect its object.
    pub fn host_disconnect(&mut self, host: usize, reason: &str) {
        let (server, session) = self.host_session(host);
        self.post(
            server,
            MainEvent::SessionMessage(
                session,
                SessionMessage::Disconnect {
                    object: self.hosts[host].object,
                    reason: reason.to_string(),
                },
            ),
        );
        self.hosts[host].connected = false;
    }

    /// React to server→host traffic: redirects, migration kick-offs,
    /// connect responses. One pass per step keeps everything deterministic.
    fn drive_hosts(&mut self) {
        let mut actions: Vec<(usize, HostAction)> = Vec::new();
        for (hi, host) in self.hosts.iter().enumerate() {
            let outbox = self.servers[host.at].outbox.clone();
            let mut box_ref = outbox.lock().unwrap();
            let mut consumed = Vec::new();
            for (i, (session, msg)) in box_ref.messages.iter().enumerate() {
                if *session != host.session || msg.object() != host.object {
                    continue;
                }
                match msg {
                    SessionMessage::ConnectResponse { response, .. } => {
                        consumed.push(i);
                        actions.push((hi, HostAction::Response(response.clone())));
                    }
                    SessionMessage::InitMigration { new_server, .. } => {
                        consumed.push(i);
                        actions.push((hi, HostAction::Migrate(*new_server)));
                    }
                    SessionMessage::Disconnect { .. } => {
                        consumed.push(i);
                        actions.push((hi, HostAction::Dropped));
                    }
                    _ => {}
                }
            }
            for i in consumed.into_iter().rev() {
                box_ref.messages.remove(i);
            }
        }

        for (hi, action) in actions {
            match action {
                HostAction::Response(response) => {
                    self.hosts[hi].responses.push(response.clone());
                    match response {
                        ConnectResponse::Success { .. } => {
                            let (server, session) = self.host_session(hi);
                            let object = self.hosts[hi].object;
                            self.post(
                                server,
                                MainEvent::SessionMessage(
                                    session,
                                    SessionMessage::ConnectAck { object },
                                ),
                            );
                            self.hosts[hi].connected = true;
                        }
                        ConnectResponse::Redirect { server } => {
                            self.reconnect(hi, server, ConnectKind::Fresh);
                        }
                        ConnectResponse::Error => {
                            self.hosts[hi].connected = false;
                        }
                    }
                }
                HostAction::Migrate(new_server) => {
                    self.reconnect(hi, new_server, ConnectKind::Migration);
                }
                HostAction::Dropped => {
                    self.hosts[hi].connected = false;
                }
            }
        }
    }

    fn reconnect(&mut self, hi: usize, server: ServerId, kind: ConnectKind) {
        let session = fresh_session();
        let object = self.hosts[hi].object;
        let mut fields = self.hosts[hi].fields.clone();
        fields.kind = kind;
        fields.oh_name = self.hosts[hi].oh_name.clone();
        self.hosts[hi].at = self.index_of(server);
        self.hosts[hi].session = session;
        self.hosts[hi].connected = false;
        self.post(server, MainEvent::SessionOpened(session));
        self.post(
            server,
            MainEvent::SessionMessage(session, SessionMessage::Connect { object, fields }),
        );
    }

    /// Datagrams delivered to the given host so far.
    pub fn host_datagrams(&self, host: usize) -> Vec<Datagram> {
        let h = &self.hosts[host];
        self.servers[h.at]
            .outbox
            .lock()
            .unwrap()
            .datagrams
            .iter()
            .filter(|(s, _)| *s == h.session)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Datagrams delivered for `object` on any server/session (used when a
    /// host has moved between servers during the test).
    pub fn datagrams_for(&self, object: ObjectId) -> Vec<Datagram> {
        let mut out = Vec::new();
        for s in &self.servers {
            for (_, d) in s.outbox.lock().unwrap().datagrams.iter() {
                if d.dst_obj == object {
                    out.push(d.clone());
                }
            }
        }
        out
    }
}

enum HostAction {
    Response(ConnectResponse),
    Migrate(ServerId),
    Dropped,
}
