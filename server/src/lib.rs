//! # Loka Server
//! One node of a space-server cluster: a fleet of these processes
//! cooperatively simulates a single 3D world, each owning the objects inside
//! its slice of the volume. The crate provides coordinate segmentation
//! (who owns which region), object segmentation (which server simulates
//! which object, backed by an external directory), fair-queued inter-server
//! links, and the migration protocol that moves a live object between
//! servers without losing or duplicating its traffic.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod bootstrap;
pub mod config;
pub mod cseg;
pub mod error;
pub mod exec;
pub mod forwarder;
pub mod loc_service;
pub mod migration;
pub mod net;
pub mod oh_transport;
pub mod oseg;
pub mod prox;
pub mod server_map;
pub mod session;
pub mod space;
pub mod telemetry;

pub use bootstrap::{build, Runtime};
pub use config::{CsegKind, OsegKind, ServerConfig, SmqKind};
pub use error::{ConfigError, ConnectRefusal, DirectoryError, ErrorClass, LinkError};
pub use space::{MainEvent, SpaceServer, SpaceServerConfig};
