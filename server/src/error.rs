use loka_shared::{ObjectId, ServerId, WireError};
use thiserror::Error;

/// How a failure is allowed to propagate. `Transient` is absorbed by retry
/// and backpressure and never reaches an object host; `Conflict` surfaces to
/// the host as a connect error; `ProtocolViolation` and `Stale` are logged
/// and discarded; `Fatal` aborts startup only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    ProtocolViolation,
    Conflict,
    Stale,
    Fatal,
}

/// Problems reading or applying configuration; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key = value`")]
    Malformed { line: usize },
    #[error("unknown config key `{key}`")]
    UnknownKey { key: String },
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    BadValue { key: String, value: String, reason: String },
    #[error("missing required key `{key}`")]
    Missing { key: String },
    #[error("server id map: {0}")]
    ServerMap(String),
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// Failures talking to the external directory store. All transient: reads
/// stay pending, writes go back on the retry queue.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend unreachable: {0}")]
    Unreachable(String),
    #[error("directory backend io: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory backend sent malformed reply")]
    MalformedReply,
}

impl DirectoryError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Failures on an inter-server link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no address known for {0}")]
    UnknownPeer(ServerId),
    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: ServerId,
        #[source]
        source: std::io::Error,
    },
    #[error("link to {peer} broken: {source}")]
    Broken {
        peer: ServerId,
        #[source]
        source: std::io::Error,
    },
    #[error("peer {peer} sent garbage: {source}")]
    Garbage {
        peer: ServerId,
        #[source]
        source: WireError,
    },
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::Garbage { .. } => ErrorClass::ProtocolViolation,
            _ => ErrorClass::Transient,
        }
    }
}

/// Why a connection attempt was refused. Surfaced to the host as a plain
/// `ConnectResponse::Error`; the detail stays in the server log.
#[derive(Debug, Error)]
pub enum ConnectRefusal {
    #[error("object {0} requested a location outside every region")]
    OutsideWorld(ObjectId),
    #[error("object {0} clamped into a region this server does not own")]
    NotOurRegion(ObjectId),
    #[error("object {0} is already connected from a different session")]
    Conflict(ObjectId),
    #[error("object {0} failed authentication")]
    AuthFailed(ObjectId),
}

impl ConnectRefusal {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectRefusal::Conflict(_) => ErrorClass::Conflict,
            _ => ErrorClass::ProtocolViolation,
        }
    }
}
