use std::fmt;

/// A position in world coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A displacement or velocity in world coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Rotation as a quaternion (x, y, z, w).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

/// Axis-aligned box, half-open on the upper bound: a point `p` is inside iff
/// `min <= p < max` on every axis. The half-open convention is what makes
/// segmentation lookups on shared faces deterministic.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    pub fn new(min: Point3, max: Point3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: Point3) -> bool {
        p.x >= self.min.x
            && p.x < self.max.x
            && p.y >= self.min.y
            && p.y < self.max.y
            && p.z >= self.min.z
            && p.z < self.max.z
    }

    /// Clamp a point into the box. The result of clamping to the upper bound
    /// is nudged inside so that the half-open `contains` still accepts it.
    pub fn clamp(&self, p: Point3) -> Point3 {
        fn clamp_axis(v: f32, lo: f32, hi: f32) -> f32 {
            if v < lo {
                lo
            } else if v >= hi {
                // largest representable value strictly below hi
                let nudged = f32::from_bits(hi.to_bits().wrapping_sub(1));
                nudged.max(lo)
            } else {
                v
            }
        }
        Point3::new(
            clamp_axis(p.x, self.min.x, self.max.x),
            clamp_axis(p.y, self.min.y, self.max.y),
            clamp_axis(p.z, self.min.z, self.max.z),
        )
    }

    pub fn extents(&self) -> Vec3 {
        Vec3::new(
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z,
        )
    }

    pub fn is_degenerate(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y || self.max.z <= self.min.z
    }
}

impl fmt::Display for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[({}, {}, {})..({}, {}, {}))",
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
        )
    }
}

/// The (possibly multi-box) part of the world one server owns.
pub type Region = Vec<Aabb>;

/// Bounding sphere carried with every object.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bounds {
    pub center: Point3,
    pub radius: f32,
}

impl Bounds {
    pub fn new(center: Point3, radius: f32) -> Self {
        Self { center, radius }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn upper_bound_is_exclusive() {
        let b = unit_box();
        assert!(b.contains(Point3::new(0.0, 0.0, 0.0)));
        assert!(!b.contains(Point3::new(1.0, 0.5, 0.5)));
        assert!(!b.contains(Point3::new(0.5, 1.0, 0.5)));
    }

    #[test]
    fn clamp_lands_inside() {
        let b = unit_box();
        let p = b.clamp(Point3::new(5.0, -3.0, 1.0));
        assert!(b.contains(p));
        let q = b.clamp(Point3::new(0.5, 0.5, 0.5));
        assert_eq!(q, Point3::new(0.5, 0.5, 0.5));
    }
}
