//! Explicit little-endian wire codec for every message the cluster puts on a
//! socket. Nothing here assumes peer endianness or struct layout: each field
//! is written and read one at a time through bounds-checked cursors.

mod frame;
mod reader;
mod server_msg;
mod session_msg;
mod writer;

pub use frame::{frame, FrameAssembler, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use reader::WireReader;
pub use server_msg::{Datagram, MigrateRecord, ServerMessage, ServerMessageKind};
pub use session_msg::{
    ConnectFields, ConnectKind, ConnectResponse, OhMigrationKind, SessionMessage,
};
pub use writer::WireWriter;

use thiserror::Error;

/// Errors produced while decoding bytes received from a peer or host. All of
/// them classify as protocol violations: the offending message is dropped and
/// logged, the channel survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated message: wanted {wanted} more bytes, had {remaining}")]
    Truncated { wanted: usize, remaining: usize },
    #[error("unknown message tag {tag}")]
    UnknownTag { tag: u8 },
    #[error("unknown enum discriminant {value} for {field}")]
    BadDiscriminant { field: &'static str, value: u8 },
    #[error("declared length {len} exceeds limit {limit}")]
    LengthOverflow { len: usize, limit: usize },
    #[error("invalid utf-8 in string field")]
    BadUtf8,
    #[error("{extra} trailing bytes after message body")]
    TrailingBytes { extra: usize },
}
