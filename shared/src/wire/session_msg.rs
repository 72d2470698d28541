use super::{WireError, WireReader, WireWriter};
use crate::motion::{Motion, OrientationSample};
use crate::spatial::Bounds;
use crate::types::{ObjectId, ServerId};

const TAG_CONNECT: u8 = 1;
const TAG_CONNECT_RESPONSE: u8 = 2;
const TAG_CONNECT_ACK: u8 = 3;
const TAG_DISCONNECT: u8 = 4;
const TAG_INIT_MIGRATION: u8 = 5;
const TAG_OH_MIGRATION: u8 = 6;

/// Whether a `Connect` introduces a brand-new object or completes the
/// host-side leg of a server-to-server migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectKind {
    Fresh,
    Migration,
}

/// Body of a `Connect` request from an object host.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectFields {
    pub kind: ConnectKind,
    pub loc: Motion,
    pub orientation: OrientationSample,
    pub bounds: Bounds,
    /// Mesh URI; empty means none.
    pub mesh: String,
    /// Opaque physics settings; empty means none.
    pub physics: Vec<u8>,
    /// Proximity query radius; 0 registers no query.
    pub query_radius: f32,
    /// Opaque credentials for the authenticator collaborator.
    pub auth: Vec<u8>,
    /// Stable name of the object host, used to recognize the same host
    /// across sessions during host-side migration.
    pub oh_name: String,
}

/// The three user-visible outcomes of a connection attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectResponse {
    Success {
        loc: Motion,
        orientation: OrientationSample,
        bounds: Bounds,
        mesh: String,
    },
    Redirect { server: ServerId },
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OhMigrationKind {
    Object,
    Entity,
    Ack,
}

/// Control traffic on the session substream between an object host and a
/// space server. Every message names the object it concerns.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionMessage {
    Connect { object: ObjectId, fields: ConnectFields },
    ConnectResponse { object: ObjectId, response: ConnectResponse },
    /// Host acknowledges a successful connect; the server enables delivery
    /// to the object only after this arrives.
    ConnectAck { object: ObjectId },
    Disconnect { object: ObjectId, reason: String },
    /// Tells the host where to reconnect because its object is being
    /// migrated to another server.
    InitMigration { object: ObjectId, new_server: ServerId },
    OhMigration { object: ObjectId, kind: OhMigrationKind },
}

impl SessionMessage {
    pub fn object(&self) -> ObjectId {
        match self {
            SessionMessage::Connect { object, .. }
            | SessionMessage::ConnectResponse { object, .. }
            | SessionMessage::ConnectAck { object }
            | SessionMessage::Disconnect { object, .. }
            | SessionMessage::InitMigration { object, .. }
            | SessionMessage::OhMigration { object, .. } => *object,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64);
        match self {
            SessionMessage::Connect { object, fields } => {
                w.u8(TAG_CONNECT);
                w.object_id(object);
                w.u8(match fields.kind {
                    ConnectKind::Fresh => 1,
                    ConnectKind::Migration => 2,
                });
                w.motion(&fields.loc);
                w.orientation(&fields.orientation);
                w.bounds(&fields.bounds);
                w.string(&fields.mesh);
                w.bytes(&fields.physics);
                w.f32(fields.query_radius);
                w.bytes(&fields.auth);
                w.string(&fields.oh_name);
            }
            SessionMessage::ConnectResponse { object, response } => {
                w.u8(TAG_CONNECT_RESPONSE);
                w.object_id(object);
                match response {
                    ConnectResponse::Success { loc, orientation, bounds, mesh } => {
                        w.u8(1);
                        w.motion(loc);
                        w.orientation(orientation);
                        w.bounds(bounds);
                        w.string(mesh);
                    }
                    ConnectResponse::Redirect { server } => {
                        w.u8(2);
                        w.server_id(*server);
                    }
                    ConnectResponse::Error => w.u8(3),
                }
            }
            SessionMessage::ConnectAck { object } => {
                w.u8(TAG_CONNECT_ACK);
                w.object_id(object);
            }
            SessionMessage::Disconnect { object, reason } => {
                w.u8(TAG_DISCONNECT);
                w.object_id(object);
                w.string(reason);
            }
            SessionMessage::InitMigration { object, new_server } => {
                w.u8(TAG_INIT_MIGRATION);
                w.object_id(object);
                w.server_id(*new_server);
            }
            SessionMessage::OhMigration { object, kind } => {
                w.u8(TAG_OH_MIGRATION);
                w.object_id(object);
                w.u8(match kind {
                    OhMigrationKind::Object => 1,
                    OhMigrationKind::Entity => 2,
                    OhMigrationKind::Ack => 3,
                });
            }
        }
        w.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<SessionMessage, WireError> {
        let mut r = WireReader::new(body);
        let tag = r.u8()?;
        let msg = match tag {
            TAG_CONNECT => {
                let object = r.object_id()?;
                let kind = match r.u8()? {
                    1 => ConnectKind::Fresh,
                    2 => ConnectKind::Migration,
                    value => {
                        return Err(WireError::BadDiscriminant { field: "connect.kind", value })
                    }
                };
                SessionMessage::Connect {
                    object,
                    fields: ConnectFields {
                        kind,
                        loc: r.motion()?,
                        orientation: r.orientation()?,
                        bounds: r.bounds()?,
                        mesh: r.string()?,
                        physics: r.bytes()?,
                        query_radius: r.f32()?,
                        auth: r.bytes()?,
                        oh_name: r.string()?,
                    },
                }
            }
            TAG_CONNECT_RESPONSE => {
                let object = r.object_id()?;
                let response = match r.u8()? {
                    1 => ConnectResponse::Success {
                        loc: r.motion()?,
                        orientation: r.orientation()?,
                        bounds: r.bounds()?,
                        mesh: r.string()?,
                    },
                    2 => ConnectResponse::Redirect { server: r.server_id()? },
                    3 => ConnectResponse::Error,
                    value => {
                        return Err(WireError::BadDiscriminant {
                            field: "connect_response.kind",
                            value,
                        })
                    }
                };
                SessionMessage::ConnectResponse { object, response }
            }
            TAG_CONNECT_ACK => SessionMessage::ConnectAck { object: r.object_id()? },
            TAG_DISCONNECT => SessionMessage::Disconnect {
                object: r.object_id()?,
                reason: r.string()?,
            },
            TAG_INIT_MIGRATION => SessionMessage::InitMigration {
                object: r.object_id()?,
                new_server: r.server_id()?,
            },
            TAG_OH_MIGRATION => {
                let object = r.object_id()?;
                let kind = match r.u8()? {
                    1 => OhMigrationKind::Object,
                    2 => OhMigrationKind::Entity,
                    3 => OhMigrationKind::Ack,
                    value => {
                        return Err(WireError::BadDiscriminant {
                            field: "oh_migration.kind",
                            value,
                        })
                    }
                };
                SessionMessage::OhMigration { object, kind }
            }
            tag => return Err(WireError::UnknownTag { tag }),
        };
        r.finish()?;
        Ok(msg)
    }
}
