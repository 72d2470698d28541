use crate::spatial::{Point3, Quat, Vec3};

/// A timestamped position/velocity sample. The space server stores the tuple
/// verbatim and treats `t` (microseconds on the producing clock) as a
/// monotonic version: a sample with a smaller `t` never replaces a newer one.
/// Extrapolation between samples is the motion collaborator's job, but the
/// trivial linear form is provided for boundary checks.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Motion {
    pub t: u64,
    pub position: Point3,
    pub velocity: Vec3,
}

impl Motion {
    pub fn new(t: u64, position: Point3, velocity: Vec3) -> Self {
        Self { t, position, velocity }
    }

    /// Linear extrapolation to time `at` (microseconds). Times before `t`
    /// return the stored position unchanged.
    pub fn extrapolate(&self, at: u64) -> Point3 {
        if at <= self.t {
            return self.position;
        }
        let dt = (at - self.t) as f32 * 1e-6;
        Point3::new(
            self.position.x + self.velocity.x * dt,
            self.position.y + self.velocity.y * dt,
            self.position.z + self.velocity.z * dt,
        )
    }
}

/// Timestamped orientation sample: rotation plus angular velocity, both
/// quaternions, versioned the same way as [`Motion`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OrientationSample {
    pub t: u64,
    pub rotation: Quat,
    pub spin: Quat,
}

impl OrientationSample {
    pub fn new(t: u64, rotation: Quat, spin: Quat) -> Self {
        Self { t, rotation, spin }
    }
}
