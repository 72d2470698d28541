//! The remote segmentation client against a miniature in-process service:
//! synchronous lookups, region caching, pushed repartitionings (delivered
//! atomically and in order), and graceful degradation when the service dies.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use loka_server::cseg::{encode_update, CoordSegmentation, RemoteSegmentation, SegmentationSnapshot};
use loka_server::exec::mailbox;
use loka_shared::{frame, Aabb, FrameAssembler, Point3, Region, ServerId, WireReader, WireWriter};

fn world() -> Aabb {
    Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(100.0, 10.0, 10.0))
}

fn half(server: u32) -> (ServerId, Region) {
    let min_x = if server == 1 { 0.0 } else { 50.0 };
    (
        ServerId(server),
        vec![Aabb::new(Point3::new(min_x, 0.0, 0.0), Point3::new(min_x + 50.0, 10.0, 10.0))],
    )
}

/// A service speaking the segmentation protocol over one accepted stream.
struct MiniService {
    stream: TcpStream,
    assembler: FrameAssembler,
    snapshot: SegmentationSnapshot,
}

impl MiniService {
    fn accept(listener: &TcpListener, snapshot: SegmentationSnapshot) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        Self { stream, assembler: FrameAssembler::new(), snapshot }
    }

    fn push_update(&mut self, snapshot: SegmentationSnapshot) {
        self.snapshot = snapshot.clone();
        let body = encode_update(&snapshot);
        self.stream.write_all(&frame(&body)).unwrap();
    }

    fn region_body(&self, server: ServerId) -> Vec<u8> {
        let region = self.snapshot.region_of(server);
        let mut w = WireWriter::new();
        w.u32(region.len() as u32);
        for b in &region {
            w.point3(&b.min);
            w.point3(&b.max);
        }
        w.into_bytes()
    }

    /// Answer queued requests, if any arrived.
    fn serve_once(&mut self) {
        let mut buf = [0u8; 1024];
        match self.stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => self.assembler.push(&buf[..n]),
            Err(_) => return,
        }
        while let Ok(Some(body)) = self.assembler.next_frame() {
            let mut r = WireReader::new(&body);
            let op = r.u8().unwrap();
            let mut reply = WireWriter::new();
            reply.u8(op);
            match op {
                1 => {
                    // lookup: answer with owner + that owner's region
                    let p = r.point3().unwrap();
                    let owner = self
                        .snapshot
                        .assignments
                        .iter()
                        .find(|(_, region)| region.iter().any(|b| b.contains(p)))
                        .map(|(s, _)| *s)
                        .unwrap_or(ServerId::NIL);
                    reply.server_id(owner);
                    reply.raw(&self.region_body(owner));
                }
                2 => {
                    let server = r.server_id().unwrap();
                    reply.raw(&self.region_body(server));
                }
                3 => {
                    reply.point3(&world().min);
                    reply.point3(&world().max);
                }
                4 => reply.u32(self.snapshot.assignments.len() as u32),
                other => panic!("unexpected op {other}"),
            }
            self.stream.write_all(&frame(&reply.into_bytes())).unwrap();
        }
    }
}

#[test]
fn lookup_resolves_by_rpc_and_then_from_cache() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let snapshot = SegmentationSnapshot { assignments: vec![half(1), half(2)] };

    let service = std::thread::spawn({
        let snapshot = snapshot.clone();
        move || {
            let mut svc = MiniService::accept(&listener, snapshot);
            for _ in 0..100 {
                svc.serve_once();
            }
        }
    });

    let mut client = RemoteSegmentation::new(addr.to_string(), world());
    assert_eq!(client.lookup(Point3::new(10.0, 5.0, 5.0)), ServerId(1));
    assert_eq!(client.lookup(Point3::new(90.0, 5.0, 5.0)), ServerId(2));
    // cached now: answered locally even though the service may be gone
    assert_eq!(client.lookup(Point3::new(12.0, 5.0, 5.0)), ServerId(1));
    assert_eq!(client.region_of(ServerId(2)).len(), 1);
    assert_eq!(client.world_region(), world());

    drop(client);
    service.join().unwrap();
}

#[test]
fn pushed_updates_invalidate_and_republish_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let first = SegmentationSnapshot { assignments: vec![half(1), half(2)] };
    // repartitioning: server 2 takes the whole world
    let second = SegmentationSnapshot {
        assignments: vec![(ServerId(2), vec![world()])],
    };

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let service = std::thread::spawn({
        let first = first.clone();
        let second = second.clone();
        move || {
            let mut svc = MiniService::accept(&listener, first.clone());
            svc.serve_once();
            // two updates, back to back; listeners must see them in order
            svc.push_update(first);
            svc.push_update(second);
            ready_tx.send(()).unwrap();
            for _ in 0..50 {
                svc.serve_once();
            }
        }
    });

    let mut client = RemoteSegmentation::new(addr.to_string(), world());
    let (listener_tx, listener_rx) = mailbox();
    client.subscribe(listener_tx);

    // seed the connection and the cache
    assert_eq!(client.lookup(Point3::new(10.0, 5.0, 5.0)), ServerId(1));
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // poll until both pushes came through; they must arrive whole and in
    // the order the service emitted them
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut snapshots = Vec::new();
    while snapshots.len() < 2 {
        client.service(Instant::now());
        snapshots.extend(listener_rx.drain());
        assert!(Instant::now() < deadline, "pushes never arrived: {snapshots:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(snapshots, vec![first.clone(), second.clone()]);

    // the cache was flushed: the old answer for (10,5,5) is gone and the
    // new partitioning answers instead
    assert_eq!(client.lookup(Point3::new(10.0, 5.0, 5.0)), ServerId(2));

    drop(client);
    service.join().unwrap();
}

#[test]
fn service_failure_degrades_to_last_known_answers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let snapshot = SegmentationSnapshot { assignments: vec![half(1), half(2)] };

    let service = std::thread::spawn({
        move || {
            let mut svc = MiniService::accept(&listener, snapshot);
            for _ in 0..20 {
                svc.serve_once();
            }
            // then the service dies
        }
    });

    let mut client = RemoteSegmentation::new(addr.to_string(), world());
    assert_eq!(client.lookup(Point3::new(10.0, 5.0, 5.0)), ServerId(1));
    service.join().unwrap();

    // cached region still answers
    assert_eq!(client.lookup(Point3::new(20.0, 5.0, 5.0)), ServerId(1));
    // a never-seen cell cannot resolve, but it degrades instead of erroring
    assert_eq!(client.lookup(Point3::new(90.0, 5.0, 5.0)), ServerId::NIL);
}
