use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use loka_shared::{ConnectFields, Datagram, ObjectId, SessionId, SessionMessage};

/// How the server talks back to object hosts. The substream transport itself
/// is an external collaborator; the core only needs these two sends.
pub trait SessionTransport: Send {
    fn send(&mut self, session: SessionId, msg: &SessionMessage) -> bool;
    fn deliver_datagram(&mut self, session: SessionId, datagram: &Datagram) -> bool;
}

/// Per-object binding between the simulation and one host session. Delivery
/// is gated on `enabled`, which only the host's `ConnectAck` flips; datagrams
/// that arrive earlier wait in `deliver`.
pub struct ObjectConnection {
    pub session: SessionId,
    pub enabled: bool,
    pub deliver: VecDeque<Datagram>,
    /// Distinguishes this binding from any later one for the same object, so
    /// a delayed cleanup cannot tear down a successor.
    pub token: u64,
}

const DELIVER_QUEUE_LIMIT: usize = 256;
const SESSION_SEND_RETRY: Duration = Duration::from_millis(50);
const SESSION_SEND_MAX_ATTEMPTS: u32 = 100;

struct SessionState {
    oh_name: Option<String>,
    objects: HashSet<ObjectId>,
}

struct PendingSend {
    session: SessionId,
    msg: SessionMessage,
    next_at: Instant,
    attempts: u32,
}

/// A connect request parked while its directory write is in flight. Any
/// further attempt from the same session is a retry and produces nothing new.
pub struct StoredConnection {
    pub session: SessionId,
    pub fields: ConnectFields,
}

pub enum DeliverOutcome {
    /// Handed to the session (or parked on its pre-ack queue).
    Delivered,
    /// No binding for that object here.
    NoRecord,
}

/// Session bookkeeping: which hosts are connected, which objects they own,
/// and the object-connection records the forwarder delivers into.
pub struct SessionManager {
    transport: Box<dyn SessionTransport>,
    sessions: HashMap<SessionId, SessionState>,
    objects: HashMap<ObjectId, ObjectConnection>,
    connecting: HashMap<ObjectId, StoredConnection>,
    /// Objects whose host handoff is authorized, by the stable host name.
    oh_migrating: HashMap<ObjectId, String>,
    retries: VecDeque<PendingSend>,
    next_token: u64,
}

impl SessionManager {
    pub fn new(transport: Box<dyn SessionTransport>) -> Self {
        Self {
            transport,
            sessions: HashMap::new(),
            objects: HashMap::new(),
            connecting: HashMap::new(),
            oh_migrating: HashMap::new(),
            retries: VecDeque::new(),
            next_token: 1,
        }
    }

    // Sessions

    pub fn open_session(&mut self, session: SessionId) {
        self.sessions
            .insert(session, SessionState { oh_name: None, objects: HashSet::new() });
        info!("session {:?} opened", session);
    }

    pub fn session_exists(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn set_oh_name(&mut self, session: SessionId, name: &str) {
        if let Some(state) = self.sessions.get_mut(&session) {
            if state.oh_name.as_deref() != Some(name) {
                info!("session {:?} identifies as object host `{}`", session, name);
                state.oh_name = Some(name.to_string());
            }
        }
    }

    pub fn oh_name(&self, session: SessionId) -> Option<&str> {
        self.sessions.get(&session)?.oh_name.as_deref()
    }

    /// Tear down a closing session. Returns every object that was attached;
    /// the caller unwinds each of them (OSEG, location, proximity).
    pub fn close_session(&mut self, session: SessionId) -> Vec<ObjectId> {
        let state = match self.sessions.remove(&session) {
            Some(s) => s,
            None => return Vec::new(),
        };
        self.retries.retain(|p| p.session != session);
        let mut torn_down: Vec<ObjectId> = state.objects.into_iter().collect();
        // connect attempts still in flight on this session die with it
        let connecting: Vec<ObjectId> = self
            .connecting
            .iter()
            .filter(|(_, sc)| sc.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in connecting {
            self.connecting.remove(&id);
            torn_down.push(id);
        }
        info!("session {:?} closed; {} objects torn down", session, torn_down.len());
        torn_down
    }

    // Object connections

    pub fn has_record(&self, object: &ObjectId) -> bool {
        self.objects.contains_key(object)
    }

    pub fn record_session(&self, object: &ObjectId) -> Option<SessionId> {
        self.objects.get(object).map(|c| c.session)
    }

    pub fn record_token(&self, object: &ObjectId) -> Option<u64> {
        self.objects.get(object).map(|c| c.token)
    }

    pub fn is_enabled(&self, object: &ObjectId) -> bool {
        self.objects.get(object).map(|c| c.enabled).unwrap_or(false)
    }

    /// Stage a connection. Disabled until [`SessionManager::enable`]; the
    /// returned token identifies exactly this binding.
    pub fn add_connection(&mut self, object: ObjectId, session: SessionId) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        if let Some(old) = self.objects.insert(
            object,
            ObjectConnection {
                session,
                enabled: false,
                deliver: VecDeque::new(),
                token,
            },
        ) {
            debug!(
                "object {} rebound from session {:?} to {:?}",
                object, old.session, session
            );
            if let Some(state) = self.sessions.get_mut(&old.session) {
                state.objects.remove(&object);
            }
        }
        if let Some(state) = self.sessions.get_mut(&session) {
            state.objects.insert(object);
        }
        token
    }

    /// Allow delivery and flush anything parked while the ack was pending.
    pub fn enable(&mut self, object: &ObjectId) {
        let Some(conn) = self.objects.get_mut(object) else {
            warn!("connect ack for {} with no staged connection", object);
            return;
        };
        conn.enabled = true;
        let session = conn.session;
        let parked: Vec<Datagram> = conn.deliver.drain(..).collect();
        for dg in parked {
            if !self.transport.deliver_datagram(session, &dg) {
                debug!("flush to {:?} failed; dropping parked datagram", session);
            }
        }
    }

    pub fn remove_connection(&mut self, object: &ObjectId) -> Option<ObjectConnection> {
        let conn = self.objects.remove(object)?;
        if let Some(state) = self.sessions.get_mut(&conn.session) {
            state.objects.remove(object);
        }
        Some(conn)
    }

    /// Deliver one datagram to the object's session, parking it if the
    /// binding is not enabled yet. At most one binding per object exists, so
    /// delivery here is delivery to at most one endpoint.
    pub fn deliver(&mut self, object: &ObjectId, datagram: Datagram) -> DeliverOutcome {
        let Some(conn) = self.objects.get_mut(object) else {
            return DeliverOutcome::NoRecord;
        };
        if !conn.enabled {
            if conn.deliver.len() >= DELIVER_QUEUE_LIMIT {
                warn!("pre-ack queue for {} full; dropping oldest", object);
                conn.deliver.pop_front();
            }
            conn.deliver.push_back(datagram);
            return DeliverOutcome::Delivered;
        }
        if !self.transport.deliver_datagram(conn.session, &datagram) {
            debug!("datagram delivery to {:?} failed; dropping", conn.session);
        }
        DeliverOutcome::Delivered
    }

    // Connecting state

    pub fn is_connecting(&self, object: &ObjectId) -> bool {
        self.connecting.contains_key(object)
    }

    pub fn connecting_session(&self, object: &ObjectId) -> Option<SessionId> {
        self.connecting.get(object).map(|sc| sc.session)
    }

    pub fn store_connecting(&mut self, object: ObjectId, session: SessionId, fields: ConnectFields) {
        self.connecting.insert(object, StoredConnection { session, fields });
    }

    pub fn take_connecting(&mut self, object: &ObjectId) -> Option<StoredConnection> {
        self.connecting.remove(object)
    }

    // Host-side migration authorization

    pub fn authorize_oh_migration(&mut self, object: ObjectId, oh_name: String) {
        self.oh_migrating.insert(object, oh_name);
    }

    pub fn oh_migration_matches(&self, object: &ObjectId, oh_name: &str) -> bool {
        self.oh_migrating.get(object).map(|n| n == oh_name).unwrap_or(false)
    }

    pub fn clear_oh_migration(&mut self, object: &ObjectId) {
        self.oh_migrating.remove(object);
    }

    // Sending

    /// Best-effort immediate send. No retry.
    pub fn send(&mut self, session: SessionId, msg: &SessionMessage) -> bool {
        self.transport.send(session, msg)
    }

    /// Send now, and if the transport refuses keep retrying on a short
    /// interval until it sticks or the attempt budget runs out.
    pub fn send_with_retry(&mut self, session: SessionId, msg: SessionMessage, now: Instant) {
        if self.transport.send(session, &msg) {
            return;
        }
        self.retries.push_back(PendingSend {
            session,
            msg,
            next_at: now + SESSION_SEND_RETRY,
            attempts: 1,
        });
    }

    /// Drive the retry queue.
    pub fn service(&mut self, now: Instant) {
        let mut still_pending = VecDeque::new();
        while let Some(mut p) = self.retries.pop_front() {
            if p.next_at > now {
                still_pending.push_back(p);
                continue;
            }
            if !self.sessions.contains_key(&p.session) {
                continue;
            }
            if self.transport.send(p.session, &p.msg) {
                continue;
            }
            p.attempts += 1;
            if p.attempts >= SESSION_SEND_MAX_ATTEMPTS {
                warn!(
                    "giving up on session message to {:?} after {} attempts",
                    p.session, p.attempts
                );
                continue;
            }
            p.next_at = now + SESSION_SEND_RETRY;
            still_pending.push_back(p);
        }
        self.retries = still_pending;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(SessionId, SessionMessage)>>>,
        delivered: Arc<Mutex<Vec<(SessionId, Datagram)>>>,
        refuse: Arc<Mutex<bool>>,
    }

    impl SessionTransport for RecordingTransport {
        fn send(&mut self, session: SessionId, msg: &SessionMessage) -> bool {
            if *self.refuse.lock().unwrap() {
                return false;
            }
            self.sent.lock().unwrap().push((session, msg.clone()));
            true
        }

        fn deliver_datagram(&mut self, session: SessionId, datagram: &Datagram) -> bool {
            if *self.refuse.lock().unwrap() {
                return false;
            }
            self.delivered.lock().unwrap().push((session, datagram.clone()));
            true
        }
    }

    fn dg(dst: ObjectId) -> Datagram {
        Datagram {
            src_server: loka_shared::ServerId(1),
            hops: 0,
            src_obj: ObjectId([7; 16]),
            dst_obj: dst,
            src_port: 9,
            dst_port: 9,
            payload: vec![1],
        }
    }

    #[test]
    fn datagrams_park_until_enabled() {
        let transport = RecordingTransport::default();
        let delivered = transport.delivered.clone();
        let mut mgr = SessionManager::new(Box::new(transport));
        let session = SessionId(1);
        let object = ObjectId([1; 16]);
        mgr.open_session(session);
        mgr.add_connection(object, session);

        assert!(matches!(mgr.deliver(&object, dg(object)), DeliverOutcome::Delivered));
        assert!(delivered.lock().unwrap().is_empty());

        mgr.enable(&object);
        assert_eq!(delivered.lock().unwrap().len(), 1);

        assert!(matches!(mgr.deliver(&object, dg(object)), DeliverOutcome::Delivered));
        assert_eq!(delivered.lock().unwrap().len(), 2);
    }

    #[test]
    fn close_session_reports_attached_objects() {
        let mut mgr = SessionManager::new(Box::new(RecordingTransport::default()));
        let session = SessionId(2);
        let a = ObjectId([1; 16]);
        let b = ObjectId([2; 16]);
        mgr.open_session(session);
        mgr.add_connection(a, session);
        mgr.add_connection(b, session);
        let mut torn = mgr.close_session(session);
        torn.sort();
        assert_eq!(torn, vec![a, b]);
        // records survive until the caller unwinds each object explicitly
        assert!(mgr.has_record(&a));
        mgr.remove_connection(&a);
        assert!(matches!(mgr.deliver(&a, dg(a)), DeliverOutcome::NoRecord));
    }

    #[test]
    fn refused_sends_are_retried_later() {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let refuse = transport.refuse.clone();
        let mut mgr = SessionManager::new(Box::new(transport));
        let session = SessionId(3);
        mgr.open_session(session);

        *refuse.lock().unwrap() = true;
        let now = Instant::now();
        mgr.send_with_retry(session, SessionMessage::ConnectAck { object: ObjectId([1; 16]) }, now);
        assert!(sent.lock().unwrap().is_empty());

        *refuse.lock().unwrap() = false;
        mgr.service(now + Duration::from_millis(60));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
