use super::{WireError, WireReader, WireWriter};
use crate::motion::{Motion, OrientationSample};
use crate::spatial::Bounds;
use crate::types::{ObjectId, Port, ServerId};

const TAG_OBJECT_DATAGRAM: u8 = 1;
const TAG_MIGRATE_PAYLOAD: u8 = 2;
const TAG_MIGRATION_ACK: u8 = 3;
const TAG_DIRECTORY_UPDATE: u8 = 4;
const TAG_KILL_OBJECT_CONNECTION: u8 = 5;

/// An opaque object-to-object (or object-to-service) datagram. `hops` counts
/// inter-server forwards and bounds the ping-pong that can occur while a
/// cache and the directory disagree about an object's owner.
#[derive(Clone, Debug, PartialEq)]
pub struct Datagram {
    pub src_server: ServerId,
    pub hops: u8,
    pub src_obj: ObjectId,
    pub dst_obj: ObjectId,
    pub src_port: Port,
    pub dst_port: Port,
    pub payload: Vec<u8>,
}

/// The wrapped-up simulation state of a migrating object, sent by the old
/// owner to the new one.
#[derive(Clone, Debug, PartialEq)]
pub struct MigrateRecord {
    pub src_server: ServerId,
    pub object: ObjectId,
    pub motion: Motion,
    pub orientation: OrientationSample,
    pub bounds: Bounds,
    pub mesh: String,
    /// Opaque per-collaborator state, keyed by collaborator tag.
    pub client_data: Vec<(String, Vec<u8>)>,
}

/// Everything one space server sends another.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    ObjectDatagram(Datagram),
    MigratePayload(MigrateRecord),
    /// Emitted by the new owner once its directory write has committed; the
    /// synchronization point that retires the old owner's transit record.
    MigrationAck {
        from: ServerId,
        to: ServerId,
        object: ObjectId,
    },
    /// Unsolicited ownership hint piggybacking on normal traffic. Updates
    /// caches only, never authoritative state. `ServerId::NIL` as the owner
    /// is a tombstone: the object left the world.
    DirectoryUpdate { object: ObjectId, owner: ServerId },
    /// Self-addressed cleanup marker that finalizes the source side of a
    /// migration after the ack arrives.
    KillObjectConnection { object: ObjectId },
}

/// Discriminant-only view, used for logging and queue accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerMessageKind {
    ObjectDatagram,
    MigratePayload,
    MigrationAck,
    DirectoryUpdate,
    KillObjectConnection,
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            ServerMessage::ObjectDatagram(_) => ServerMessageKind::ObjectDatagram,
            ServerMessage::MigratePayload(_) => ServerMessageKind::MigratePayload,
            ServerMessage::MigrationAck { .. } => ServerMessageKind::MigrationAck,
            ServerMessage::DirectoryUpdate { .. } => ServerMessageKind::DirectoryUpdate,
            ServerMessage::KillObjectConnection { .. } => ServerMessageKind::KillObjectConnection,
        }
    }

    /// Encode to a frame body: `[u8 tag][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64);
        match self {
            ServerMessage::ObjectDatagram(dg) => {
                w.u8(TAG_OBJECT_DATAGRAM);
                w.server_id(dg.src_server);
                w.u8(dg.hops);
                w.object_id(&dg.src_obj);
                w.object_id(&dg.dst_obj);
                w.u16(dg.src_port);
                w.u16(dg.dst_port);
                w.raw(&dg.payload);
            }
            ServerMessage::MigratePayload(rec) => {
                w.u8(TAG_MIGRATE_PAYLOAD);
                w.server_id(rec.src_server);
                w.object_id(&rec.object);
                w.motion(&rec.motion);
                w.orientation(&rec.orientation);
                w.bounds(&rec.bounds);
                w.string(&rec.mesh);
                w.u32(rec.client_data.len() as u32);
                for (key, data) in &rec.client_data {
                    w.string(key);
                    w.bytes(data);
                }
            }
            ServerMessage::MigrationAck { from, to, object } => {
                w.u8(TAG_MIGRATION_ACK);
                w.server_id(*from);
                w.server_id(*to);
                w.object_id(object);
            }
            ServerMessage::DirectoryUpdate { object, owner } => {
                w.u8(TAG_DIRECTORY_UPDATE);
                w.object_id(object);
                w.server_id(*owner);
            }
            ServerMessage::KillObjectConnection { object } => {
                w.u8(TAG_KILL_OBJECT_CONNECTION);
                w.object_id(object);
            }
        }
        w.into_bytes()
    }

    /// Decode a frame body produced by [`ServerMessage::encode`].
    pub fn decode(body: &[u8]) -> Result<ServerMessage, WireError> {
        let mut r = WireReader::new(body);
        let tag = r.u8()?;
        let msg = match tag {
            TAG_OBJECT_DATAGRAM => ServerMessage::ObjectDatagram(Datagram {
                src_server: r.server_id()?,
                hops: r.u8()?,
                src_obj: r.object_id()?,
                dst_obj: r.object_id()?,
                src_port: r.u16()?,
                dst_port: r.u16()?,
                payload: r.rest(),
            }),
            TAG_MIGRATE_PAYLOAD => {
                let src_server = r.server_id()?;
                let object = r.object_id()?;
                let motion = r.motion()?;
                let orientation = r.orientation()?;
                let bounds = r.bounds()?;
                let mesh = r.string()?;
                let count = r.u32()? as usize;
                let mut client_data = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let key = r.string()?;
                    let data = r.bytes()?;
                    client_data.push((key, data));
                }
                ServerMessage::MigratePayload(MigrateRecord {
                    src_server,
                    object,
                    motion,
                    orientation,
                    bounds,
                    mesh,
                    client_data,
                })
            }
            TAG_MIGRATION_ACK => ServerMessage::MigrationAck {
                from: r.server_id()?,
                to: r.server_id()?,
                object: r.object_id()?,
            },
            TAG_DIRECTORY_UPDATE => ServerMessage::DirectoryUpdate {
                object: r.object_id()?,
                owner: r.server_id()?,
            },
            TAG_KILL_OBJECT_CONNECTION => {
                ServerMessage::KillObjectConnection { object: r.object_id()? }
            }
            tag => return Err(WireError::UnknownTag { tag }),
        };
        r.finish()?;
        Ok(msg)
    }

    /// Encoded size, used for queue and token-bucket accounting.
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }
}
