//! Start-of-day wiring: turn a parsed [`ServerConfig`] into a running set of
//! executors. Fatal errors here abort startup; nothing later does.

use std::net::TcpListener;
use std::path::Path;
use std::time::Instant;

use log::info;

use loka_shared::ServerId;

use crate::config::{OsegKind, ServerConfig};
use crate::cseg;
use crate::error::ConfigError;
use crate::exec::{bounded_mailbox, mailbox, spawn, Mailbox};
use crate::loc_service::StandardLocationService;
use crate::net::{NetCmd, NetDriver, ServerMessageQueue};
use crate::oh_transport::{HostListener, OhCmd, TcpHostTransport};
use crate::oseg::{
    CraqSegmentation, DirectoryPool, DirectoryStore, LocSegmentation, MemoryStore,
    ObjectSegmentation, TcpStore,
};
use crate::space::{SpaceServer, SpaceServerConfig};
use crate::server_map::ServerIdMap;
use crate::telemetry::{Counters, CountersHandle};

/// A fully wired space-server process: the main-executor server plus the
/// handles needed to shut the other executors down.
pub struct Runtime {
    pub server: SpaceServer,
    pub net_cmds: Mailbox<NetCmd>,
    pub oh_cmds: Mailbox<OhCmd>,
    pub counters: CountersHandle,
}

/// Build every executor from config. Binds both listen sockets, spawns the
/// network and host-transport executors and the directory pools.
pub fn build(cfg: &ServerConfig) -> Result<Runtime, ConfigError> {
    let counters = Counters::new_handle();
    let map = ServerIdMap::load(Path::new(&cfg.server_id_map))?;
    let my_addr = map.lookup(cfg.server_id).ok_or_else(|| {
        ConfigError::ServerMap(format!("no entry for this server ({})", cfg.server_id))
    })?;

    // inter-server listener
    let listener = TcpListener::bind(my_addr).map_err(|e| ConfigError::BadValue {
        key: "server_id_map".to_string(),
        value: my_addr.to_string(),
        reason: format!("cannot bind: {e}"),
    })?;
    info!("inter-server listener on {}", my_addr);

    // network executor
    let (net_tx, net_rx) = mailbox::<NetCmd>();
    let (inbound_tx, inbound_rx) = bounded_mailbox(cfg.smq_queue_len.max(16));
    let driver = NetDriver::new(
        cfg.server_id,
        listener,
        map,
        inbound_tx,
        cfg.smq_recv_bandwidth,
        counters.clone(),
    )
    .map_err(|e| ConfigError::ServerMap(format!("network driver: {e}")))?;
    spawn("loka-net", move || driver.run(net_rx));

    // directory executors + object segmentation
    let (dir_tx, dir_rx) = mailbox();
    let oseg: Box<dyn ObjectSegmentation> = match cfg.oseg_kind {
        OsegKind::Craq => {
            let get_pool = directory_pool("loka-dir-get", &cfg.oseg_get_hosts, cfg.oseg_pool, &dir_tx);
            let set_pool = directory_pool("loka-dir-set", &cfg.oseg_set_hosts, cfg.oseg_pool, &dir_tx);
            let mut seg = CraqSegmentation::new(
                cfg.server_id,
                cfg.oseg_prefix,
                cfg.oseg_cache_size,
                cfg.oseg_cache_ttl,
                cfg.oseg_lookup_queue,
                get_pool,
                set_pool,
                counters.clone(),
            );
            seg.set_not_found_sit_out(cfg.oseg_not_found_retry);
            Box::new(seg)
        }
        OsegKind::Loc => Box::new(LocSegmentation::new(cfg.server_id)),
    };

    // spatial segmentation
    let cseg = cseg::from_config(cfg)?;

    // object-host transport executor
    let oh_listener = TcpListener::bind(&cfg.oh_listen).map_err(|e| ConfigError::BadValue {
        key: "oh.listen".to_string(),
        value: cfg.oh_listen.clone(),
        reason: format!("cannot bind: {e}"),
    })?;
    let (oh_tx, oh_rx) = mailbox::<OhCmd>();
    let transport = Box::new(TcpHostTransport::new(oh_tx.clone()));

    let smq = ServerMessageQueue::new(
        cfg.server_id,
        cfg.smq_kind,
        cfg.smq_queue_len,
        cfg.smq_send_bandwidth,
        net_tx.clone(),
        inbound_rx,
        counters.clone(),
    );

    let server = SpaceServer::assemble(
        SpaceServerConfig {
            id: cfg.server_id,
            max_hops: cfg.migration_max_hops,
            migration_timeout: cfg.migration_timeout,
            migration_grace: cfg.migration_grace,
        },
        cseg,
        oseg,
        smq,
        transport,
        Box::new(StandardLocationService::new()),
        dir_rx,
        counters.clone(),
        Instant::now(),
    );

    let host_listener = HostListener::new(oh_listener, server.mailbox(), counters.clone())
        .map_err(|e| ConfigError::BadValue {
            key: "oh.listen".to_string(),
            value: cfg.oh_listen.clone(),
            reason: e.to_string(),
        })?;
    spawn("loka-oh", move || host_listener.run(oh_rx));

    Ok(Runtime { server, net_cmds: net_tx, oh_cmds: oh_tx, counters })
}

/// One pool of `connections` workers. Hosts are assigned round-robin; with
/// no hosts configured the pool degrades to a process-local store, which is
/// only suitable for single-server deployments.
fn directory_pool(
    name: &str,
    hosts: &[String],
    connections: usize,
    results: &Mailbox<crate::oseg::DirResult>,
) -> DirectoryPool {
    let connections = connections.max(1);
    if hosts.is_empty() {
        info!("{}: no directory hosts configured; using in-process store", name);
        let store = MemoryStore::new();
        return DirectoryPool::spawn_threaded(
            name,
            connections,
            move || Box::new(store.clone()) as Box<dyn DirectoryStore>,
            results.clone(),
        );
    }
    let hosts: Vec<String> = hosts.to_vec();
    let counter = std::sync::atomic::AtomicUsize::new(0);
    DirectoryPool::spawn_threaded(
        name,
        connections,
        move || {
            let i = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let host = hosts[i % hosts.len()].clone();
            Box::new(TcpStore::new(host)) as Box<dyn DirectoryStore>
        },
        results.clone(),
    )
}

/// Place pre-seeded static scene objects into a loc-mode segmentation.
/// Resolution happens against CSEG once, here, at startup.
pub fn place_static_objects(
    seg: &mut LocSegmentation,
    cseg: &mut dyn crate::cseg::CoordSegmentation,
    objects: &[(loka_shared::ObjectId, loka_shared::Point3)],
) {
    for (object, position) in objects {
        let server = cseg.lookup(*position);
        if server != ServerId::NIL {
            seg.place(*object, server);
        }
    }
}
