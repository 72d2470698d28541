use crate::motion::{Motion, OrientationSample};
use crate::spatial::{Bounds, Point3, Quat, Vec3};
use crate::types::{ObjectId, ServerId};

/// Append-only encoder, the mirror of [`super::WireReader`]. Infallible:
/// sizes are validated where messages are built, not here.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }

    pub fn object_id(&mut self, id: &ObjectId) {
        self.buf.extend_from_slice(&id.0);
    }

    pub fn server_id(&mut self, id: ServerId) {
        self.u32(id.0);
    }

    pub fn point3(&mut self, p: &Point3) {
        self.f32(p.x);
        self.f32(p.y);
        self.f32(p.z);
    }

    pub fn vec3(&mut self, v: &Vec3) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
    }

    pub fn quat(&mut self, q: &Quat) {
        self.f32(q.x);
        self.f32(q.y);
        self.f32(q.z);
        self.f32(q.w);
    }

    pub fn motion(&mut self, m: &Motion) {
        self.u64(m.t);
        self.point3(&m.position);
        self.vec3(&m.velocity);
    }

    pub fn orientation(&mut self, o: &OrientationSample) {
        self.u64(o.t);
        self.quat(&o.rotation);
        self.quat(&o.spin);
    }

    pub fn bounds(&mut self, b: &Bounds) {
        self.point3(&b.center);
        self.f32(b.radius);
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    pub fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    pub fn raw(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
}
