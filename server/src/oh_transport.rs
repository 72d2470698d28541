//! TCP transport for object hosts. The substream layer proper is an external
//! collaborator; this adapter speaks its framed subset: every frame body is
//! `[kind u8][inner bytes]`, where kind 1 is a session-control message,
//! kind 2 an object datagram, and kind 3 a location update.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use loka_shared::{
    frame, Datagram, FrameAssembler, KeyGenerator, ServerMessage, SessionId, SessionMessage,
    WireReader, WireWriter,
};

use crate::exec::{Inbox, Mailbox};
use crate::session::SessionTransport;
use crate::space::MainEvent;
use crate::telemetry::{Counters, CountersHandle};

const KIND_SESSION: u8 = 1;
const KIND_DATAGRAM: u8 = 2;
const KIND_LOCATION: u8 = 3;

/// Commands from the main executor to the host-transport thread.
pub enum OhCmd {
    Send { session: SessionId, frame: Vec<u8> },
    /// Graceful stop, phase one: existing sessions drain, no new ones.
    StopAccepting,
    Shutdown,
}

/// The main-executor half: encodes outbound traffic and posts it to the
/// listener thread. Sends only fail once the transport is shutting down.
pub struct TcpHostTransport {
    cmds: Mailbox<OhCmd>,
}

impl TcpHostTransport {
    pub fn new(cmds: Mailbox<OhCmd>) -> Self {
        Self { cmds }
    }
}

impl SessionTransport for TcpHostTransport {
    fn send(&mut self, session: SessionId, msg: &SessionMessage) -> bool {
        let mut body = WireWriter::with_capacity(64);
        body.u8(KIND_SESSION);
        body.raw(&msg.encode());
        self.cmds.post(OhCmd::Send { session, frame: frame(&body.into_bytes()) })
    }

    fn deliver_datagram(&mut self, session: SessionId, datagram: &Datagram) -> bool {
        let mut body = WireWriter::with_capacity(64);
        body.u8(KIND_DATAGRAM);
        body.raw(&ServerMessage::ObjectDatagram(datagram.clone()).encode());
        self.cmds.post(OhCmd::Send { session, frame: frame(&body.into_bytes()) })
    }
}

struct HostConn {
    stream: std::net::TcpStream,
    assembler: FrameAssembler,
    outbuf: VecDeque<u8>,
}

/// The listener thread: accepts host connections, assigns session ids,
/// decodes inbound frames into [`MainEvent`]s, and writes queued outbound
/// frames. Runs until told to shut down.
pub struct HostListener {
    listener: TcpListener,
    conns: HashMap<SessionId, HostConn>,
    keys: KeyGenerator<SessionId>,
    events: Mailbox<MainEvent>,
    counters: CountersHandle,
    accepting: bool,
}

impl HostListener {
    pub fn new(
        listener: TcpListener,
        events: Mailbox<MainEvent>,
        counters: CountersHandle,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            conns: HashMap::new(),
            keys: KeyGenerator::new(Duration::from_secs(60)),
            events,
            counters,
            accepting: true,
        })
    }

    pub fn run(mut self, cmds: Inbox<OhCmd>) {
        info!("object-host listener on {:?}", self.listener.local_addr().ok());
        loop {
            let mut shutdown = false;
            while let Some(cmd) = cmds.try_recv() {
                match cmd {
                    OhCmd::Send { session, frame } => {
                        if let Some(conn) = self.conns.get_mut(&session) {
                            conn.outbuf.extend(frame);
                        }
                    }
                    OhCmd::StopAccepting => self.stop_accepting(),
                    OhCmd::Shutdown => shutdown = true,
                }
            }
            if shutdown {
                info!("object-host listener stopping");
                return;
            }
            self.service(Instant::now());
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop accepting while existing sessions drain (graceful stop).
    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    fn service(&mut self, _now: Instant) {
        if self.accepting {
            loop {
                match self.listener.accept() {
                    Ok((stream, addr)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        let _ = stream.set_nodelay(true);
                        let session = self.keys.generate();
                        debug!("host {} connected as session {:?}", addr, session);
                        self.conns.insert(
                            session,
                            HostConn {
                                stream,
                                assembler: FrameAssembler::new(),
                                outbuf: VecDeque::new(),
                            },
                        );
                        self.events.post(MainEvent::SessionOpened(session));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("host accept failed: {}", e);
                        break;
                    }
                }
            }
        }

        let mut closed = Vec::new();
        for (&session, conn) in self.conns.iter_mut() {
            // writes
            while !conn.outbuf.is_empty() {
                let (head, _) = conn.outbuf.as_slices();
                match conn.stream.write(head) {
                    Ok(0) => {
                        closed.push(session);
                        break;
                    }
                    Ok(n) => {
                        conn.outbuf.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        closed.push(session);
                        break;
                    }
                }
            }
            if closed.contains(&session) {
                continue;
            }

            // reads
            let mut buf = [0u8; 8192];
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        closed.push(session);
                        break;
                    }
                    Ok(n) => conn.assembler.push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        closed.push(session);
                        break;
                    }
                }
            }
            loop {
                match conn.assembler.next_frame() {
                    Ok(Some(body)) => {
                        if let Some(event) = decode_host_frame(session, &body, &self.counters) {
                            self.events.post(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("session {:?} framing error: {}; closing", session, e);
                        Counters::bump(&self.counters.protocol_violations);
                        closed.push(session);
                        break;
                    }
                }
            }
        }

        for session in closed {
            if self.conns.remove(&session).is_some() {
                self.keys.recycle(session);
                self.events.post(MainEvent::SessionClosed(session));
            }
        }
    }
}

fn decode_host_frame(
    session: SessionId,
    body: &[u8],
    counters: &CountersHandle,
) -> Option<MainEvent> {
    let mut r = WireReader::new(body);
    let kind = r.u8().ok()?;
    let inner = r.rest();
    match kind {
        KIND_SESSION => match SessionMessage::decode(&inner) {
            Ok(msg) => Some(MainEvent::SessionMessage(session, msg)),
            Err(e) => {
                warn!("bad session message from {:?}: {}", session, e);
                Counters::bump(&counters.protocol_violations);
                None
            }
        },
        KIND_DATAGRAM => match ServerMessage::decode(&inner) {
            Ok(ServerMessage::ObjectDatagram(dg)) => {
                Some(MainEvent::SessionDatagram(session, dg))
            }
            _ => {
                warn!("bad datagram frame from {:?}", session);
                Counters::bump(&counters.protocol_violations);
                None
            }
        },
        KIND_LOCATION => {
            let mut r = WireReader::new(&inner);
            match (r.object_id(), r.motion()) {
                (Ok(object), Ok(motion)) => {
                    Some(MainEvent::LocationUpdate { session, object, motion })
                }
                _ => {
                    warn!("bad location update from {:?}", session);
                    Counters::bump(&counters.protocol_violations);
                    None
                }
            }
        }
        _ => {
            warn!("unknown host frame kind {} from {:?}", kind, session);
            Counters::bump(&counters.protocol_violations);
            None
        }
    }
}
