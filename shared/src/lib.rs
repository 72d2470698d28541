//! # Loka Shared
//! Common functionality shared between the loka space server and object-host
//! tooling: identifiers, spatial math, motion records, and the explicit
//! little-endian wire protocol spoken between servers and by session control
//! streams.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod key_generator;
mod lru;
mod motion;
mod spatial;
mod types;
mod wire;

pub use key_generator::KeyGenerator;
pub use lru::TtlLruCache;
pub use motion::{Motion, OrientationSample};
pub use spatial::{Aabb, Bounds, Point3, Quat, Region, Vec3};
pub use types::{ObjectId, Port, ServerId, SessionId, PORT_SESSION};
pub use wire::{
    frame, ConnectFields, ConnectKind, ConnectResponse, Datagram, FrameAssembler, MigrateRecord,
    OhMigrationKind, ServerMessage, ServerMessageKind, SessionMessage, WireError, WireReader,
    WireWriter, FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
