use std::time::Instant;

use loka_shared::{Aabb, Point3, Region, ServerId};

use super::{CoordSegmentation, SegmentationSnapshot};
use crate::exec::Mailbox;

/// Static segmentation: the world box split into a fixed per-dimension grid.
/// Server ids are assigned in x-fastest order starting at 1, so the layout is
/// reproducible from the two config values alone. Change events never fire.
pub struct UniformSegmentation {
    world: Aabb,
    perdim: (u32, u32, u32),
}

impl UniformSegmentation {
    pub fn new(world: Aabb, perdim: (u32, u32, u32)) -> Self {
        assert!(!world.is_degenerate(), "world region must have positive extent");
        assert!(
            perdim.0 > 0 && perdim.1 > 0 && perdim.2 > 0,
            "per-dimension counts must be positive"
        );
        Self { world, perdim }
    }

    fn cell_size(&self) -> (f32, f32, f32) {
        let e = self.world.extents();
        (
            e.x / self.perdim.0 as f32,
            e.y / self.perdim.1 as f32,
            e.z / self.perdim.2 as f32,
        )
    }

    fn cell_of(&self, p: Point3) -> (u32, u32, u32) {
        let (cx, cy, cz) = self.cell_size();
        let clamp_idx = |v: f32, lo: f32, cell: f32, n: u32| -> u32 {
            let idx = ((v - lo) / cell) as i64;
            idx.clamp(0, n as i64 - 1) as u32
        };
        (
            clamp_idx(p.x, self.world.min.x, cx, self.perdim.0),
            clamp_idx(p.y, self.world.min.y, cy, self.perdim.1),
            clamp_idx(p.z, self.world.min.z, cz, self.perdim.2),
        )
    }

    fn cell_box(&self, ix: u32, iy: u32, iz: u32) -> Aabb {
        let (cx, cy, cz) = self.cell_size();
        let min = Point3::new(
            self.world.min.x + ix as f32 * cx,
            self.world.min.y + iy as f32 * cy,
            self.world.min.z + iz as f32 * cz,
        );
        let max = Point3::new(
            self.world.min.x + (ix + 1) as f32 * cx,
            self.world.min.y + (iy + 1) as f32 * cy,
            self.world.min.z + (iz + 1) as f32 * cz,
        );
        Aabb::new(min, max)
    }
}

impl CoordSegmentation for UniformSegmentation {
    fn lookup(&mut self, point: Point3) -> ServerId {
        let p = self.world.clamp(point);
        let (ix, iy, iz) = self.cell_of(p);
        let (nx, ny, _) = self.perdim;
        ServerId(1 + ix + iy * nx + iz * nx * ny)
    }

    fn region_of(&mut self, server: ServerId) -> Region {
        if server.is_nil() || server.0 > self.num_servers() {
            return Region::new();
        }
        let sid = server.0 - 1;
        let (nx, ny, _) = self.perdim;
        let ix = sid % nx;
        let iy = (sid / nx) % ny;
        let iz = sid / (nx * ny);
        vec![self.cell_box(ix, iy, iz)]
    }

    fn world_region(&self) -> Aabb {
        self.world
    }

    fn num_servers(&self) -> u32 {
        self.perdim.0 * self.perdim.1 * self.perdim.2
    }

    fn subscribe(&mut self, _listener: Mailbox<SegmentationSnapshot>) {
        // static grid: the mapping never changes, nothing will ever fire
    }

    fn service(&mut self, _now: Instant) {}
}
