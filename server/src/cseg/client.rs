use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, warn};

use loka_shared::{frame, Aabb, FrameAssembler, Point3, Region, ServerId, WireReader, WireWriter};

use super::{CoordSegmentation, SegmentationSnapshot};
use crate::exec::Mailbox;

const OP_LOOKUP: u8 = 1;
const OP_REGION: u8 = 2;
const OP_WORLD: u8 = 3;
const OP_COUNT: u8 = 4;
const OP_UPDATE: u8 = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Client of the central segmentation service, reached over one long-lived
/// TCP connection. `region_of` answers are cached; the cache is flushed and
/// subscribers republished whenever the service pushes a new partitioning.
/// RPC failures degrade to the last known answer (or the null server) —
/// spatial queries never error.
pub struct RemoteSegmentation {
    service_addr: String,
    stream: Option<TcpStream>,
    assembler: FrameAssembler,
    next_connect_attempt: Option<Instant>,

    world: Aabb,
    num_servers: u32,
    regions: HashMap<ServerId, Region>,

    listeners: Vec<Mailbox<SegmentationSnapshot>>,
    /// Pushes that arrived interleaved with an RPC reply; dispatched in
    /// arrival order once the call completes.
    queued_pushes: Vec<SegmentationSnapshot>,
}

impl RemoteSegmentation {
    /// `fallback_world` answers `world_region` until the service has been
    /// reached at least once.
    pub fn new(service_addr: String, fallback_world: Aabb) -> Self {
        Self {
            service_addr,
            stream: None,
            assembler: FrameAssembler::new(),
            next_connect_attempt: None,
            world: fallback_world,
            num_servers: 0,
            regions: HashMap::new(),
            listeners: Vec::new(),
            queued_pushes: Vec::new(),
        }
    }

    fn ensure_connected(&mut self, now: Instant) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if let Some(at) = self.next_connect_attempt {
            if now < at {
                return false;
            }
        }
        self.next_connect_attempt = Some(now + RECONNECT_BACKOFF);
        let addr = match self.service_addr.to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(a) => a,
                None => {
                    warn!("cseg service address {} resolves to nothing", self.service_addr);
                    return false;
                }
            },
            Err(e) => {
                warn!("cannot resolve cseg service {}: {}", self.service_addr, e);
                return false;
            }
        };
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.stream = Some(stream);
                self.assembler = FrameAssembler::new();
                debug!("connected to cseg service at {}", self.service_addr);
                // refresh the global facts while the connection is fresh
                self.refresh_world();
                true
            }
            Err(e) => {
                warn!("cseg service connect failed: {}", e);
                false
            }
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.assembler = FrameAssembler::new();
    }

    /// Write one request and read frames until the matching reply appears.
    /// Pushes encountered while waiting are queued, preserving their order.
    fn rpc(&mut self, op: u8, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        if !self.ensure_connected(now) {
            return None;
        }
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(op);
        body.extend_from_slice(payload);
        let request = frame(&body);

        let stream = self.stream.as_mut().unwrap();
        if let Err(e) = stream.write_all(&request) {
            warn!("cseg rpc write failed: {}", e);
            self.drop_stream();
            return None;
        }
        if stream.set_read_timeout(Some(RPC_TIMEOUT)).is_err() {
            self.drop_stream();
            return None;
        }

        let deadline = now + RPC_TIMEOUT;
        let mut buf = [0u8; 4096];
        loop {
            // frames already buffered may contain the reply
            loop {
                match self.assembler.next_frame() {
                    Ok(Some(reply)) => {
                        if reply.first() == Some(&OP_UPDATE) {
                            if let Some(snap) = parse_update(&reply[1..]) {
                                self.queued_pushes.push(snap);
                            }
                            continue;
                        }
                        if reply.first() == Some(&op) {
                            return Some(reply[1..].to_vec());
                        }
                        debug!("cseg service sent unexpected reply op {:?}", reply.first());
                        continue;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("cseg service framing error: {}", e);
                        self.drop_stream();
                        return None;
                    }
                }
            }
            if Instant::now() >= deadline {
                debug!("cseg rpc op {} timed out", op);
                return None;
            }
            let stream = self.stream.as_mut().unwrap();
            match stream.read(&mut buf) {
                Ok(0) => {
                    warn!("cseg service closed the connection");
                    self.drop_stream();
                    return None;
                }
                Ok(n) => self.assembler.push(&buf[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return None;
                }
                Err(e) => {
                    warn!("cseg rpc read failed: {}", e);
                    self.drop_stream();
                    return None;
                }
            }
        }
    }

    fn refresh_world(&mut self) {
        let now = Instant::now();
        if let Some(reply) = self.rpc(OP_WORLD, &[], now) {
            let mut r = WireReader::new(&reply);
            if let (Ok(min), Ok(max)) = (r.point3(), r.point3()) {
                self.world = Aabb::new(min, max);
            }
        }
        if let Some(reply) = self.rpc(OP_COUNT, &[], now) {
            let mut r = WireReader::new(&reply);
            if let Ok(n) = r.u32() {
                self.num_servers = n;
            }
        }
    }

    /// Apply one pushed snapshot: flush the region cache, adopt the new
    /// assignments, republish to every listener.
    fn apply_snapshot(&mut self, snap: SegmentationSnapshot) {
        self.regions.clear();
        for (server, region) in &snap.assignments {
            self.regions.insert(*server, region.clone());
        }
        self.num_servers = snap.assignments.len() as u32;
        self.listeners.retain(|l| l.post(snap.clone()));
    }

    fn flush_queued_pushes(&mut self) {
        let pushes = std::mem::take(&mut self.queued_pushes);
        for snap in pushes {
            self.apply_snapshot(snap);
        }
    }

    /// Last-known answer for a point, from the cached assignments.
    fn cached_lookup(&self, p: Point3) -> ServerId {
        for (server, region) in &self.regions {
            if region.iter().any(|b| b.contains(p)) {
                return *server;
            }
        }
        ServerId::NIL
    }
}

impl CoordSegmentation for RemoteSegmentation {
    fn lookup(&mut self, point: Point3) -> ServerId {
        let p = self.world.clamp(point);
        let cached = self.cached_lookup(p);
        if !cached.is_nil() {
            return cached;
        }
        let now = Instant::now();
        let mut w = WireWriter::with_capacity(12);
        w.point3(&p);
        let answer = match self.rpc(OP_LOOKUP, &w.into_bytes(), now) {
            Some(reply) => {
                let mut r = WireReader::new(&reply);
                match (r.server_id(), read_region(&mut r)) {
                    (Ok(server), Some(region)) => {
                        if !server.is_nil() && !region.is_empty() {
                            self.regions.insert(server, region);
                        }
                        server
                    }
                    _ => {
                        warn!("cseg service sent malformed lookup reply");
                        ServerId::NIL
                    }
                }
            }
            None => self.cached_lookup(p),
        };
        self.flush_queued_pushes();
        answer
    }

    fn region_of(&mut self, server: ServerId) -> Region {
        if let Some(region) = self.regions.get(&server) {
            return region.clone();
        }
        let now = Instant::now();
        let mut w = WireWriter::with_capacity(4);
        w.server_id(server);
        let answer = match self.rpc(OP_REGION, &w.into_bytes(), now) {
            Some(reply) => {
                let mut r = WireReader::new(&reply);
                match read_region(&mut r) {
                    Some(region) => {
                        self.regions.insert(server, region.clone());
                        region
                    }
                    None => Region::new(),
                }
            }
            None => Region::new(),
        };
        self.flush_queued_pushes();
        answer
    }

    fn world_region(&self) -> Aabb {
        self.world
    }

    fn num_servers(&self) -> u32 {
        self.num_servers
    }

    fn subscribe(&mut self, listener: Mailbox<SegmentationSnapshot>) {
        self.listeners.push(listener);
    }

    fn service(&mut self, now: Instant) {
        if !self.ensure_connected(now) {
            return;
        }
        // poll for pushed updates without blocking the executor
        let stream = self.stream.as_mut().unwrap();
        if stream.set_nonblocking(true).is_err() {
            self.drop_stream();
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.as_mut().unwrap().read(&mut buf) {
                Ok(0) => {
                    warn!("cseg service closed the connection");
                    self.drop_stream();
                    break;
                }
                Ok(n) => self.assembler.push(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("cseg service read failed: {}", e);
                    self.drop_stream();
                    break;
                }
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.set_nonblocking(false);
        }
        loop {
            match self.assembler.next_frame() {
                Ok(Some(body)) if body.first() == Some(&OP_UPDATE) => {
                    if let Some(snap) = parse_update(&body[1..]) {
                        self.queued_pushes.push(snap);
                    }
                }
                Ok(Some(body)) => {
                    debug!("discarding stray cseg reply op {:?}", body.first());
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("cseg service framing error: {}", e);
                    self.drop_stream();
                    break;
                }
            }
        }
        self.flush_queued_pushes();
    }
}

fn read_region(r: &mut WireReader) -> Option<Region> {
    let count = r.u32().ok()? as usize;
    if count > 4096 {
        return None;
    }
    let mut region = Region::with_capacity(count);
    for _ in 0..count {
        let min = r.point3().ok()?;
        let max = r.point3().ok()?;
        region.push(Aabb::new(min, max));
    }
    Some(region)
}

fn parse_update(payload: &[u8]) -> Option<SegmentationSnapshot> {
    let mut r = WireReader::new(payload);
    let server_count = r.u32().ok()? as usize;
    if server_count > 4096 {
        return None;
    }
    let mut assignments = Vec::with_capacity(server_count);
    for _ in 0..server_count {
        let server = r.server_id().ok()?;
        let region = read_region(&mut r)?;
        assignments.push((server, region));
    }
    Some(SegmentationSnapshot { assignments })
}

/// Encode a pushed update the way the service does; shared with the tests'
/// miniature service.
pub fn encode_update(snapshot: &SegmentationSnapshot) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.u8(OP_UPDATE);
    w.u32(snapshot.assignments.len() as u32);
    for (server, region) in &snapshot.assignments {
        w.server_id(*server);
        w.u32(region.len() as u32);
        for b in region {
            w.point3(&b.min);
            w.point3(&b.max);
        }
    }
    w.into_bytes()
}
