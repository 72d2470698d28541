//! Coordinate segmentation: who owns which slice of the world volume.

mod client;
mod uniform;

pub use client::{encode_update, RemoteSegmentation};
pub use uniform::UniformSegmentation;

use std::time::Instant;

use loka_shared::{Aabb, Point3, Region, ServerId};

use crate::config::{CsegKind, ServerConfig};
use crate::error::ConfigError;
use crate::exec::Mailbox;

/// One complete `server -> region` assignment, delivered to subscribers as a
/// unit so no listener ever observes a partially-applied repartitioning.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationSnapshot {
    pub assignments: Vec<(ServerId, Region)>,
}

impl SegmentationSnapshot {
    pub fn region_of(&self, server: ServerId) -> Region {
        self.assignments
            .iter()
            .find(|(s, _)| *s == server)
            .map(|(_, r)| r.clone())
            .unwrap_or_default()
    }
}

/// Spatial -> server queries over a fixed world volume. `lookup` is total:
/// points outside the world are clamped to it first.
pub trait CoordSegmentation: Send {
    fn lookup(&mut self, point: Point3) -> ServerId;
    fn region_of(&mut self, server: ServerId) -> Region;
    fn world_region(&self) -> Aabb;
    fn num_servers(&self) -> u32;
    /// Subscribe to repartitioning updates. Listeners observe snapshots in
    /// the order the authoritative service emitted them.
    fn subscribe(&mut self, listener: Mailbox<SegmentationSnapshot>);
    /// Pump I/O and dispatch any pending pushes. No-op for static grids.
    fn service(&mut self, now: Instant);
}

/// Build the configured implementation. The concrete type is chosen here
/// once and injected into everything that needs spatial queries; there is no
/// global registry to consult later.
pub fn from_config(cfg: &ServerConfig) -> Result<Box<dyn CoordSegmentation>, ConfigError> {
    match cfg.cseg_kind {
        CsegKind::Uniform => Ok(Box::new(UniformSegmentation::new(
            cfg.cseg_region,
            cfg.cseg_perdim,
        ))),
        CsegKind::Client => Ok(Box::new(RemoteSegmentation::new(
            format!("{}:{}", cfg.cseg_service_host, cfg.cseg_service_port),
            cfg.cseg_region,
        ))),
    }
}
