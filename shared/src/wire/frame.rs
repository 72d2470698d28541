use super::WireError;

/// `[u32 length][u8 tag][payload]`; the length covers the tag and payload
/// but not itself.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body. A peer declaring more than this is
/// speaking a different protocol; the connection is dropped rather than the
/// allocator exercised.
pub const MAX_FRAME_LEN: usize = 4 << 20;

/// Incremental reassembler for a framed byte stream. Feed it whatever the
/// socket produced; it hands back only complete `[tag, payload...]` bodies,
/// so partial reads never surface to message decoding.
#[derive(Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Number of buffered-but-incomplete bytes.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete frame body, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.pending.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(WireError::LengthOverflow { len, limit: MAX_FRAME_LEN });
        }
        if self.pending.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let body = self.pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.pending.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(body))
    }
}

/// Wrap an encoded message body (tag already included) in a frame header.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}
