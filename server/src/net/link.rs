use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use loka_shared::{frame, FrameAssembler, ServerId, ServerMessage, WireReader, WireWriter};

use crate::exec::{BoundedMailbox, Inbox};
use crate::net::{NetCmd, TokenBucket};
use crate::server_map::ServerIdMap;
use crate::telemetry::{Counters, CountersHandle};

/// First frame on every inter-server stream: `[0u8][u32 server_id]`. Tag 0
/// is reserved so a hello can never be confused with a message.
const HELLO_TAG: u8 = 0;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_CONNECT_ATTEMPTS: u32 = 5;
/// How long a stream that lost the symmetric-connect tie-break keeps being
/// drained before it is fully closed.
const TIEBREAK_GRACE: Duration = Duration::from_secs(5);

enum LinkState {
    /// Waiting for the next (re)connect attempt.
    Idle { next_attempt: Instant, attempts: u32 },
    /// Established stream, possibly with unwritten bytes.
    Established {
        stream: TcpStream,
        assembler: FrameAssembler,
        outbuf: VecDeque<u8>,
    },
}

struct PeerLink {
    state: LinkState,
    /// Frames waiting for the link to come up.
    pending: VecDeque<Vec<u8>>,
}

/// An accepted stream whose peer has not yet said hello.
struct Handshaking {
    stream: TcpStream,
    assembler: FrameAssembler,
    since: Instant,
}

/// A stream on the losing side of the tie-break: reads are still drained
/// until the grace deadline so nothing in flight is lost, writes stop.
struct GraceStream {
    peer: ServerId,
    stream: TcpStream,
    assembler: FrameAssembler,
    until: Instant,
}

/// The network executor's state: one lazily-established TCP link per peer,
/// framed reads fanned into the main executor's bounded inbound queue, and
/// the deterministic resolution of symmetric connects (the lower server id
/// keeps its own outbound stream).
pub struct NetDriver {
    id: ServerId,
    listener: TcpListener,
    map: ServerIdMap,
    links: HashMap<ServerId, PeerLink>,
    handshaking: Vec<Handshaking>,
    grace: Vec<GraceStream>,
    inbound: BoundedMailbox<(ServerId, ServerMessage)>,
    recv_bucket: TokenBucket,
    counters: CountersHandle,
    shutdown: bool,
}

impl NetDriver {
    pub fn new(
        id: ServerId,
        listener: TcpListener,
        map: ServerIdMap,
        inbound: BoundedMailbox<(ServerId, ServerMessage)>,
        recv_bandwidth: u64,
        counters: CountersHandle,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            id,
            listener,
            map,
            links: HashMap::new(),
            handshaking: Vec::new(),
            grace: Vec::new(),
            inbound,
            recv_bucket: TokenBucket::new(recv_bandwidth.max(1), Instant::now()),
            counters,
            shutdown: false,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Peers with an established stream right now.
    pub fn established_peers(&self) -> Vec<ServerId> {
        let mut peers: Vec<ServerId> = self
            .links
            .iter()
            .filter(|(_, l)| matches!(l.state, LinkState::Established { .. }))
            .map(|(p, _)| *p)
            .collect();
        peers.sort();
        peers
    }

    pub fn handle_cmd(&mut self, cmd: NetCmd, now: Instant) {
        match cmd {
            NetCmd::SendTo { peer, frame } => self.send_to(peer, frame, now),
            NetCmd::Shutdown => self.shutdown = true,
        }
    }

    fn hello_frame(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(5);
        w.u8(HELLO_TAG);
        w.server_id(self.id);
        frame(&w.into_bytes())
    }

    fn send_to(&mut self, peer: ServerId, framed: Vec<u8>, now: Instant) {
        if peer == self.id {
            warn!("net driver asked to send to itself; dropping");
            return;
        }
        let link = self.links.entry(peer).or_insert_with(|| PeerLink {
            state: LinkState::Idle { next_attempt: now, attempts: 0 },
            pending: VecDeque::new(),
        });
        match &mut link.state {
            LinkState::Established { outbuf, .. } => {
                outbuf.extend(framed);
            }
            LinkState::Idle { .. } => link.pending.push_back(framed),
        }
    }

    /// One pass of non-blocking work: connects, accepts, handshakes, reads,
    /// writes, grace-stream drains. Run in a loop on the network executor or
    /// pumped directly by tests.
    pub fn service(&mut self, now: Instant) {
        self.progress_connects(now);
        self.accept_new(now);
        self.progress_handshakes(now);
        self.pump_links(now);
        self.pump_grace(now);
    }

    fn accept_new(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    trace!("accepted inter-server stream from {}", addr);
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    self.handshaking.push(Handshaking {
                        stream,
                        assembler: FrameAssembler::new(),
                        since: now,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn progress_handshakes(&mut self, now: Instant) {
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for mut hs in self.handshaking.drain(..) {
            let mut buf = [0u8; 256];
            let mut dead = false;
            loop {
                match hs.stream.read(&mut buf) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => hs.assembler.push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        dead = true;
                        break;
                    }
                }
            }
            if dead {
                continue;
            }
            match hs.assembler.next_frame() {
                Ok(Some(body)) => {
                    let mut r = WireReader::new(&body);
                    match (r.u8(), r.server_id()) {
                        (Ok(HELLO_TAG), Ok(peer)) if !peer.is_nil() => {
                            ready.push((peer, hs));
                        }
                        _ => {
                            warn!("inter-server stream opened without a valid hello; closing");
                            Counters::bump(&self.counters.protocol_violations);
                        }
                    }
                }
                Ok(None) => {
                    if now.duration_since(hs.since) < CONNECT_TIMEOUT {
                        keep.push(hs);
                    } else {
                        debug!("handshake timed out");
                    }
                }
                Err(e) => {
                    warn!("handshake framing error: {}", e);
                    Counters::bump(&self.counters.protocol_violations);
                }
            }
        }
        self.handshaking = keep;
        for (peer, hs) in ready {
            self.adopt_inbound(peer, hs, now);
        }
    }

    /// An inbound stream identified itself as `peer`. If a stream (or a
    /// connect attempt) toward the same peer already exists, both ends have
    /// dialed simultaneously; the side with the *lower* id keeps its own
    /// outbound and the other stream drains for the grace period.
    fn adopt_inbound(&mut self, peer: ServerId, hs: Handshaking, now: Instant) {
        let duplicate = self
            .links
            .get(&peer)
            .map(|l| matches!(l.state, LinkState::Established { .. }))
            .unwrap_or(false);

        if duplicate && self.id < peer {
            info!(
                "symmetric connect with {}: keeping our outbound stream, draining theirs",
                peer
            );
            self.grace.push(GraceStream {
                peer,
                stream: hs.stream,
                assembler: hs.assembler,
                until: now + TIEBREAK_GRACE,
            });
            return;
        }

        if duplicate {
            info!(
                "symmetric connect with {}: keeping their stream, draining our outbound",
                peer
            );
        }
        let hello = self.hello_frame();
        let link = self.links.entry(peer).or_insert_with(|| PeerLink {
            state: LinkState::Idle { next_attempt: now, attempts: 0 },
            pending: VecDeque::new(),
        });
        // whatever the old state held must not be lost
        let mut outbuf = VecDeque::new();
        let mut displaced = None;
        if let LinkState::Established { stream, assembler, outbuf: old_buf } =
            std::mem::replace(&mut link.state, LinkState::Idle { next_attempt: now, attempts: 0 })
        {
            outbuf = old_buf;
            displaced = Some((stream, assembler));
        }
        for framed in link.pending.drain(..) {
            outbuf.extend(framed);
        }
        let mut stream = hs.stream;
        let _ = stream.write_all(&hello);
        link.state = LinkState::Established {
            stream,
            assembler: hs.assembler,
            outbuf,
        };
        if let Some((stream, assembler)) = displaced {
            self.grace.push(GraceStream {
                peer,
                stream,
                assembler,
                until: now + TIEBREAK_GRACE,
            });
        }
    }

    fn progress_connects(&mut self, now: Instant) {
        let due: Vec<ServerId> = self
            .links
            .iter()
            .filter(|(_, l)| {
                !l.pending.is_empty()
                    && matches!(l.state, LinkState::Idle { next_attempt, .. } if next_attempt <= now)
            })
            .map(|(p, _)| *p)
            .collect();
        for peer in due {
            self.try_connect(peer, now);
        }
    }

    fn try_connect(&mut self, peer: ServerId, now: Instant) {
        let addr = match self.map.lookup(peer) {
            Some(a) => a,
            None => {
                warn!("no address for {}; dropping {} queued frames", peer, {
                    self.links.get(&peer).map(|l| l.pending.len()).unwrap_or(0)
                });
                if let Some(link) = self.links.get_mut(&peer) {
                    link.pending.clear();
                }
                return;
            }
        };
        let attempts = match &self.links[&peer].state {
            LinkState::Idle { attempts, .. } => *attempts,
            _ => return,
        };
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nonblocking(true);
                let _ = stream.set_nodelay(true);
                let hello = self.hello_frame();
                let link = self.links.get_mut(&peer).unwrap();
                let mut outbuf: VecDeque<u8> = hello.into_iter().collect();
                for framed in link.pending.drain(..) {
                    outbuf.extend(framed);
                }
                link.state = LinkState::Established {
                    stream,
                    assembler: FrameAssembler::new(),
                    outbuf,
                };
                debug!("connected to {}", peer);
            }
            Err(e) => {
                let link = self.links.get_mut(&peer).unwrap();
                let attempts = attempts + 1;
                if attempts >= MAX_CONNECT_ATTEMPTS {
                    // shed the head message and note the disconnection, but
                    // keep trying: peers may be partitioned only briefly
                    if let Some(dropped) = link.pending.pop_front() {
                        warn!(
                            "connect to {} failed {} times ({}); dropping {}-byte message",
                            peer,
                            attempts,
                            e,
                            dropped.len()
                        );
                    }
                    Counters::bump(&self.counters.peer_disconnects);
                    Counters::bump(&self.counters.datagrams_dropped);
                    link.state = LinkState::Idle {
                        next_attempt: now + jittered(CONNECT_BASE_BACKOFF, 1),
                        attempts: 0,
                    };
                } else {
                    debug!("connect to {} failed ({}); attempt {}", peer, e, attempts);
                    link.state = LinkState::Idle {
                        next_attempt: now + jittered(CONNECT_BASE_BACKOFF, attempts),
                        attempts,
                    };
                }
            }
        }
    }

    fn pump_links(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for (&peer, link) in self.links.iter_mut() {
            let LinkState::Established { stream, assembler, outbuf } = &mut link.state else {
                continue;
            };

            // writes: per-connection writability polling; WouldBlock on one
            // peer leaves every other peer unaffected
            while !outbuf.is_empty() {
                let (head, _) = outbuf.as_slices();
                match stream.write(head) {
                    Ok(0) => {
                        failed.push(peer);
                        break;
                    }
                    Ok(n) => {
                        outbuf.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("write to {} failed: {}", peer, e);
                        failed.push(peer);
                        break;
                    }
                }
            }
            if failed.contains(&peer) {
                continue;
            }

            // reads, paced by the receive-bandwidth bucket; when the budget
            // is spent the bytes wait in the kernel buffer until it refills
            let mut buf = [0u8; 8192];
            loop {
                if self.recv_bucket.available(now) == 0 {
                    break;
                }
                match stream.read(&mut buf) {
                    Ok(0) => {
                        failed.push(peer);
                        break;
                    }
                    Ok(n) => {
                        let _ = self.recv_bucket.try_consume(n, now);
                        assembler.push(&buf[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("read from {} failed: {}", peer, e);
                        failed.push(peer);
                        break;
                    }
                }
            }
            loop {
                match assembler.next_frame() {
                    Ok(Some(body)) => {
                        deliver(&self.inbound, &self.counters, peer, &body);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{} sent an unframeable stream: {}; closing", peer, e);
                        Counters::bump(&self.counters.protocol_violations);
                        failed.push(peer);
                        break;
                    }
                }
            }
        }

        failed.sort();
        failed.dedup();
        for peer in failed {
            Counters::bump(&self.counters.peer_disconnects);
            if let Some(link) = self.links.get_mut(&peer) {
                link.state = LinkState::Idle {
                    next_attempt: now + jittered(CONNECT_BASE_BACKOFF, 1),
                    attempts: 0,
                };
            }
        }
    }

    fn pump_grace(&mut self, now: Instant) {
        let inbound = self.inbound.clone();
        let counters = self.counters.clone();
        self.grace.retain_mut(|gs| {
            if now >= gs.until {
                debug!("closing tie-break loser stream to {}", gs.peer);
                return false;
            }
            let mut buf = [0u8; 4096];
            loop {
                match gs.stream.read(&mut buf) {
                    Ok(0) => return false,
                    Ok(n) => gs.assembler.push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => return false,
                }
            }
            loop {
                match gs.assembler.next_frame() {
                    Ok(Some(body)) => deliver(&inbound, &counters, gs.peer, &body),
                    Ok(None) => break,
                    Err(_) => return false,
                }
            }
            true
        });
    }

    /// Production loop: drain commands, pump sockets, sleep briefly.
    pub fn run(mut self, cmds: Inbox<NetCmd>) {
        loop {
            let now = Instant::now();
            while let Some(cmd) = cmds.try_recv() {
                self.handle_cmd(cmd, now);
            }
            if self.shutdown {
                info!("network executor stopping");
                return;
            }
            self.service(now);
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn deliver(
    inbound: &BoundedMailbox<(ServerId, ServerMessage)>,
    counters: &CountersHandle,
    peer: ServerId,
    body: &[u8],
) {
    if body.first() == Some(&HELLO_TAG) {
        // re-sent hello after a tie-break handover; nothing to do
        return;
    }
    match ServerMessage::decode(body) {
        Ok(msg) => {
            if !inbound.try_post((peer, msg)) {
                // receive queue full: shed the incoming message
                Counters::bump(&counters.recv_overflow_drops);
            }
        }
        Err(e) => {
            warn!("dropping malformed message from {}: {}", peer, e);
            Counters::bump(&counters.protocol_violations);
        }
    }
}

fn jittered(base: Duration, attempt: u32) -> Duration {
    let backoff = base * 2u32.saturating_pow(attempt.min(6));
    backoff + Duration::from_millis(fastrand::u64(0..100))
}
