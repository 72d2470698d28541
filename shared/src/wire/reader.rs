use super::WireError;
use crate::motion::{Motion, OrientationSample};
use crate::spatial::{Bounds, Point3, Quat, Vec3};
use crate::types::{ObjectId, ServerId};

/// Longest variable-length field (mesh URI, client-data blob, …) a message
/// may declare. Anything larger is treated as a protocol violation before a
/// single byte is allocated for it.
pub const MAX_VAR_FIELD: usize = 1 << 20;

/// Bounds-checked cursor over a received message body. Every accessor either
/// yields a fully decoded value or a [`WireError`]; there is no partial read.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails unless the whole body was consumed. Called at the end of every
    /// message decode so junk appended to a valid body is still rejected.
    pub fn finish(self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes { extra: self.remaining() });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated { wanted: n, remaining: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn object_id(&mut self) -> Result<ObjectId, WireError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(ObjectId(raw))
    }

    pub fn server_id(&mut self) -> Result<ServerId, WireError> {
        Ok(ServerId(self.u32()?))
    }

    pub fn point3(&mut self) -> Result<Point3, WireError> {
        Ok(Point3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    pub fn vec3(&mut self) -> Result<Vec3, WireError> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    pub fn quat(&mut self) -> Result<Quat, WireError> {
        Ok(Quat { x: self.f32()?, y: self.f32()?, z: self.f32()?, w: self.f32()? })
    }

    pub fn motion(&mut self) -> Result<Motion, WireError> {
        Ok(Motion { t: self.u64()?, position: self.point3()?, velocity: self.vec3()? })
    }

    pub fn orientation(&mut self) -> Result<OrientationSample, WireError> {
        Ok(OrientationSample { t: self.u64()?, rotation: self.quat()?, spin: self.quat()? })
    }

    pub fn bounds(&mut self) -> Result<Bounds, WireError> {
        Ok(Bounds { center: self.point3()?, radius: self.f32()? })
    }

    /// `u32` length-prefixed byte field.
    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        if len > MAX_VAR_FIELD {
            return Err(WireError::LengthOverflow { len, limit: MAX_VAR_FIELD });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// `u32` length-prefixed UTF-8 field.
    pub fn string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.bytes()?).map_err(|_| WireError::BadUtf8)
    }

    /// The unparsed remainder of the body. Used for datagram payloads, whose
    /// length is implied by the frame.
    pub fn rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        out
    }
}
