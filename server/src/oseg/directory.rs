//! Client side of the external key-value directory. Two independent pools
//! (one for reads, one for writes) each keep a fixed number of parallel
//! connections; requests are fanned out round-robin and completions posted
//! back to the main executor as messages.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use loka_shared::{ObjectId, ServerId};

use crate::error::DirectoryError;
use crate::exec::{mailbox, spawn, Inbox, Mailbox};

/// Directory key: one deployment-namespace byte followed by the 32 hex
/// characters of the object id, so multiple clusters can share a store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirKey(pub [u8; 33]);

impl DirKey {
    pub fn new(prefix: u8, object: &ObjectId) -> Self {
        let mut raw = [0u8; 33];
        raw[0] = prefix;
        raw[1..].copy_from_slice(object.to_hex().as_bytes());
        DirKey(raw)
    }
}

impl std::fmt::Debug for DirKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DirKey({})", String::from_utf8_lossy(&self.0))
    }
}

/// Fixed-width directory value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirEntry {
    pub server: ServerId,
    pub radius: f32,
}

impl DirEntry {
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.server.0.to_le_bytes());
        out[4..].copy_from_slice(&self.radius.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != 8 {
            return None;
        }
        Some(DirEntry {
            server: ServerId(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            radius: f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }
}

/// Token correlating an asynchronous write with its completion.
pub type WriteToken = u64;

#[derive(Clone, Debug)]
pub enum DirRequest {
    Get { key: DirKey },
    Set { key: DirKey, entry: DirEntry, token: WriteToken },
}

#[derive(Clone, Debug)]
pub enum DirResult {
    /// `entry` is `None` both for a genuine not-found and for a transport
    /// failure; either way the caller retries after a sit-out and nothing
    /// surfaces as a hard error.
    Get { key: DirKey, entry: Option<DirEntry> },
    SetDone { token: WriteToken, ok: bool },
}

/// Blocking transport to one directory node. Implementations reconnect
/// internally; an `Err` means this attempt failed and the operation will be
/// retried by the layer above.
pub trait DirectoryStore: Send {
    fn get(&mut self, key: &DirKey) -> Result<Option<DirEntry>, DirectoryError>;
    fn set(&mut self, key: &DirKey, entry: DirEntry) -> Result<(), DirectoryError>;
}

enum PoolMode {
    /// Requests run synchronously when `pump` is called, on the caller's
    /// thread. Used by the tests to keep directory completions deterministic.
    Inline {
        store: Box<dyn DirectoryStore>,
        queue: VecDeque<DirRequest>,
    },
    /// One executor thread per connection; requests fan out round-robin.
    Threaded {
        workers: Vec<Mailbox<DirRequest>>,
        next: usize,
    },
}

/// One pool of parallel directory connections. Completions for requests
/// submitted through the same pool arrive in submission order per worker, so
/// same-object writes (always issued from the same server) stay serialized
/// by routing on the key.
pub struct DirectoryPool {
    mode: PoolMode,
    results: Mailbox<DirResult>,
}

impl DirectoryPool {
    pub fn inline(store: Box<dyn DirectoryStore>, results: Mailbox<DirResult>) -> Self {
        Self {
            mode: PoolMode::Inline { store, queue: VecDeque::new() },
            results,
        }
    }

    /// Spawn `connections` worker threads, each owning one transport built
    /// by `make_store`.
    pub fn spawn_threaded(
        name: &str,
        connections: usize,
        make_store: impl Fn() -> Box<dyn DirectoryStore> + Send + Sync + 'static,
        results: Mailbox<DirResult>,
    ) -> Self {
        assert!(connections > 0, "directory pool needs at least one connection");
        let make_store = Arc::new(make_store);
        let mut workers = Vec::with_capacity(connections);
        for i in 0..connections {
            let (tx, rx) = mailbox::<DirRequest>();
            let results = results.clone();
            let make_store = Arc::clone(&make_store);
            spawn(&format!("{name}-{i}"), move || {
                let mut store = make_store();
                worker_loop(&mut *store, rx, results);
            });
            workers.push(tx);
        }
        Self {
            mode: PoolMode::Threaded { workers, next: 0 },
            results,
        }
    }

    pub fn submit(&mut self, request: DirRequest) {
        match &mut self.mode {
            PoolMode::Inline { queue, .. } => queue.push_back(request),
            PoolMode::Threaded { workers, next } => {
                // route by key so same-object operations stay on one worker
                let idx = match &request {
                    DirRequest::Get { key } | DirRequest::Set { key, .. } => {
                        (key.0[1] as usize) % workers.len()
                    }
                };
                if !workers[idx].post(request.clone()) {
                    // worker died; round-robin onto a surviving one
                    let fallback = *next % workers.len();
                    *next = next.wrapping_add(1);
                    if !workers[fallback].post(request) {
                        warn!("directory pool has no live workers; dropping request");
                    }
                }
            }
        }
    }

    /// Run queued inline requests to completion. No-op for threaded pools.
    pub fn pump(&mut self) {
        if let PoolMode::Inline { store, queue } = &mut self.mode {
            while let Some(request) = queue.pop_front() {
                let result = execute(&mut **store, &request);
                if !self.results.post(result) {
                    break;
                }
            }
        }
    }
}

fn worker_loop(
    store: &mut dyn DirectoryStore,
    requests: Inbox<DirRequest>,
    results: Mailbox<DirResult>,
) {
    loop {
        match requests.recv_timeout(Duration::from_millis(250)) {
            Some(request) => {
                let result = execute(store, &request);
                if !results.post(result) {
                    return;
                }
            }
            None => {
                // idle tick; nothing to do, channel may also be closing
            }
        }
    }
}

fn execute(store: &mut dyn DirectoryStore, request: &DirRequest) -> DirResult {
    match request {
        DirRequest::Get { key } => match store.get(key) {
            Ok(entry) => DirResult::Get { key: *key, entry },
            Err(e) => {
                debug!("directory get failed ({}); treating as not-found", e);
                DirResult::Get { key: *key, entry: None }
            }
        },
        DirRequest::Set { key, entry, token } => match store.set(key, *entry) {
            Ok(()) => DirResult::SetDone { token: *token, ok: true },
            Err(e) => {
                warn!("directory set failed ({}); will retry", e);
                DirResult::SetDone { token: *token, ok: false }
            }
        },
    }
}

/// Shared in-memory store. Every clone sees the same map, which is what the
/// tests use to stand in for the whole external deployment.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<std::collections::HashMap<DirKey, DirEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read, bypassing the pool machinery. Test-oriented.
    pub fn peek(&self, key: &DirKey) -> Option<DirEntry> {
        self.map.lock().unwrap().get(key).copied()
    }
}

impl DirectoryStore for MemoryStore {
    fn get(&mut self, key: &DirKey) -> Result<Option<DirEntry>, DirectoryError> {
        Ok(self.map.lock().unwrap().get(key).copied())
    }

    fn set(&mut self, key: &DirKey, entry: DirEntry) -> Result<(), DirectoryError> {
        self.map.lock().unwrap().insert(*key, entry);
        Ok(())
    }
}

const OP_GET: u8 = 1;
const OP_SET: u8 = 2;
const STATUS_NOT_FOUND: u8 = 0;
const STATUS_OK: u8 = 1;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport to one directory node. Request: `[op][key 33][entry 8 if
/// set]`; reply: `[status][entry 8 if found]`. Reconnects lazily; any I/O
/// error drops the connection and fails the attempt.
pub struct TcpStore {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpStore {
    pub fn new(addr: String) -> Self {
        Self { addr, stream: None }
    }

    fn connect(&mut self) -> Result<&mut TcpStream, DirectoryError> {
        if self.stream.is_none() {
            let addr = self
                .addr
                .to_socket_addrs()
                .map_err(|e| DirectoryError::Unreachable(format!("{}: {}", self.addr, e)))?
                .next()
                .ok_or_else(|| {
                    DirectoryError::Unreachable(format!("{} resolves to nothing", self.addr))
                })?;
            let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
            stream.set_read_timeout(Some(IO_TIMEOUT))?;
            stream.set_write_timeout(Some(IO_TIMEOUT))?;
            let _ = stream.set_nodelay(true);
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    fn transact(&mut self, request: &[u8], want_entry: bool) -> Result<Option<DirEntry>, DirectoryError> {
        let result = (|| {
            let stream = self.connect()?;
            stream.write_all(request)?;
            let mut status = [0u8; 1];
            stream.read_exact(&mut status)?;
            match status[0] {
                STATUS_NOT_FOUND => Ok(None),
                STATUS_OK if want_entry => {
                    let mut raw = [0u8; 8];
                    stream.read_exact(&mut raw)?;
                    DirEntry::decode(&raw)
                        .map(Some)
                        .ok_or(DirectoryError::MalformedReply)
                }
                STATUS_OK => Ok(None),
                _ => Err(DirectoryError::MalformedReply),
            }
        })();
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

impl DirectoryStore for TcpStore {
    fn get(&mut self, key: &DirKey) -> Result<Option<DirEntry>, DirectoryError> {
        let mut request = Vec::with_capacity(34);
        request.push(OP_GET);
        request.extend_from_slice(&key.0);
        self.transact(&request, true)
    }

    fn set(&mut self, key: &DirKey, entry: DirEntry) -> Result<(), DirectoryError> {
        let mut request = Vec::with_capacity(42);
        request.push(OP_SET);
        request.extend_from_slice(&key.0);
        request.extend_from_slice(&entry.encode());
        self.transact(&request, false).map(|_| ())
    }
}
