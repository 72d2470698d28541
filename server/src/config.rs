use std::fmt;
use std::path::Path;
use std::time::Duration;

use loka_shared::{Aabb, Point3, ServerId};

use crate::error::ConfigError;

/// Which coordinate segmentation implementation to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsegKind {
    /// Fixed per-dimension grid, computed locally, never changes.
    Uniform,
    /// Client of the central segmentation service.
    Client,
}

/// Which object directory implementation to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsegKind {
    /// Directory-backed (the real thing).
    Craq,
    /// Derived from CSEG on last-known position; read-only, static scenes.
    Loc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmqKind {
    Fair,
    Fifo,
}

/// Everything a space server is told at startup. Field names follow the
/// config-file keys (`server.id`, `smq.queue_len`, …).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_id: ServerId,

    pub cseg_kind: CsegKind,
    pub cseg_service_host: String,
    pub cseg_service_port: u16,
    pub cseg_region: Aabb,
    pub cseg_perdim: (u32, u32, u32),

    pub oseg_kind: OsegKind,
    pub oseg_prefix: u8,
    pub oseg_get_hosts: Vec<String>,
    pub oseg_set_hosts: Vec<String>,
    pub oseg_pool: usize,
    pub oseg_cache_size: usize,
    pub oseg_cache_ttl: Duration,
    pub oseg_lookup_queue: usize,
    pub oseg_not_found_retry: Duration,

    pub smq_kind: SmqKind,
    pub smq_send_bandwidth: u64,
    pub smq_recv_bandwidth: u64,
    pub smq_queue_len: usize,

    pub migration_timeout: Duration,
    pub migration_max_hops: u8,
    pub migration_grace: Duration,

    pub server_id_map: String,
    pub oh_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::NIL,
            cseg_kind: CsegKind::Uniform,
            cseg_service_host: "127.0.0.1".to_string(),
            cseg_service_port: 6234,
            cseg_region: Aabb::new(
                Point3::new(-1000.0, -1000.0, -1000.0),
                Point3::new(1000.0, 1000.0, 1000.0),
            ),
            cseg_perdim: (1, 1, 1),
            oseg_kind: OsegKind::Craq,
            oseg_prefix: b'A',
            oseg_get_hosts: Vec::new(),
            oseg_set_hosts: Vec::new(),
            oseg_pool: 4,
            oseg_cache_size: 200,
            oseg_cache_ttl: Duration::from_secs(8),
            oseg_lookup_queue: 512,
            oseg_not_found_retry: Duration::from_millis(500),
            smq_kind: SmqKind::Fair,
            smq_send_bandwidth: 1_000_000,
            smq_recv_bandwidth: 1_000_000,
            smq_queue_len: 1024,
            migration_timeout: Duration::from_secs(30),
            migration_max_hops: 3,
            migration_grace: Duration::from_secs(60),
            server_id_map: "servermap.txt".to_string(),
            oh_listen: "0.0.0.0:7777".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse `key = value` lines. `#` starts a comment; blank lines are
    /// skipped; unknown keys are fatal so typos do not silently fall back to
    /// defaults.
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = ServerConfig::default();
        let mut saw_server_id = false;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Malformed { line: idx + 1 })?;
            let key = key.trim();
            let value = value.trim();
            if key == "server.id" {
                saw_server_id = true;
            }
            cfg.apply(key, value)?;
        }
        if !saw_server_id {
            return Err(ConfigError::Missing { key: "server.id".to_string() });
        }
        if cfg.server_id.is_nil() {
            return Err(ConfigError::BadValue {
                key: "server.id".to_string(),
                value: "0".to_string(),
                reason: "0 is reserved as the null server".to_string(),
            });
        }
        Ok(cfg)
    }

    pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg = Self::parse_str(&text)?;
        for (key, value) in overrides {
            cfg.apply(key, value)?;
        }
        Ok(cfg)
    }

    /// Apply one `key`/`value` pair.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn bad(key: &str, value: &str, reason: impl fmt::Display) -> ConfigError {
            ConfigError::BadValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }
        fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: fmt::Display,
        {
            value.parse::<T>().map_err(|e| bad(key, value, e))
        }

        match key {
            "server.id" => self.server_id = ServerId(num(key, value)?),
            "cseg.kind" => {
                self.cseg_kind = match value {
                    "uniform" => CsegKind::Uniform,
                    "client" => CsegKind::Client,
                    _ => return Err(bad(key, value, "expected uniform|client")),
                }
            }
            "cseg.service.host" => self.cseg_service_host = value.to_string(),
            "cseg.service.port" => self.cseg_service_port = num(key, value)?,
            "cseg.region" => {
                let parts: Vec<f32> = value
                    .split(',')
                    .map(|p| p.trim().parse::<f32>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| bad(key, value, e))?;
                if parts.len() != 6 {
                    return Err(bad(key, value, "expected 6 comma-separated floats"));
                }
                let region = Aabb::new(
                    Point3::new(parts[0], parts[1], parts[2]),
                    Point3::new(parts[3], parts[4], parts[5]),
                );
                if region.is_degenerate() {
                    return Err(bad(key, value, "region must have positive extent"));
                }
                self.cseg_region = region;
            }
            "cseg.perdim" => {
                let parts: Vec<u32> = value
                    .split(',')
                    .map(|p| p.trim().parse::<u32>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| bad(key, value, e))?;
                if parts.len() != 3 || parts.iter().any(|&c| c == 0) {
                    return Err(bad(key, value, "expected 3 positive counts"));
                }
                self.cseg_perdim = (parts[0], parts[1], parts[2]);
            }
            "oseg.kind" => {
                self.oseg_kind = match value {
                    "craq" => OsegKind::Craq,
                    "loc" => OsegKind::Loc,
                    _ => return Err(bad(key, value, "expected craq|loc")),
                }
            }
            "oseg.prefix" => {
                let bytes = value.as_bytes();
                if bytes.len() != 1 {
                    return Err(bad(key, value, "expected a single byte"));
                }
                self.oseg_prefix = bytes[0];
            }
            "oseg.get_hosts" => self.oseg_get_hosts = split_hosts(value),
            "oseg.set_hosts" => self.oseg_set_hosts = split_hosts(value),
            "oseg.pool" => self.oseg_pool = num(key, value)?,
            "oseg.cache.size" => self.oseg_cache_size = num(key, value)?,
            "oseg.cache.ttl" => self.oseg_cache_ttl = Duration::from_secs(num(key, value)?),
            "oseg.lookup_queue" => self.oseg_lookup_queue = num(key, value)?,
            "oseg.not_found_retry_ms" => {
                self.oseg_not_found_retry = Duration::from_millis(num(key, value)?)
            }
            "smq.kind" => {
                self.smq_kind = match value {
                    "fair" => SmqKind::Fair,
                    "fifo" => SmqKind::Fifo,
                    _ => return Err(bad(key, value, "expected fair|fifo")),
                }
            }
            "smq.send_bandwidth" => self.smq_send_bandwidth = num(key, value)?,
            "smq.recv_bandwidth" => self.smq_recv_bandwidth = num(key, value)?,
            "smq.queue_len" => self.smq_queue_len = num(key, value)?,
            "migration.timeout" => {
                self.migration_timeout = Duration::from_secs(num(key, value)?)
            }
            "migration.max_hops" => self.migration_max_hops = num(key, value)?,
            "migration.grace" => self.migration_grace = Duration::from_secs(num(key, value)?),
            "server_id_map" => self.server_id_map = value.to_string(),
            "oh.listen" => self.oh_listen = value.to_string(),
            _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
        }
        Ok(())
    }
}

fn split_hosts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let cfg = ServerConfig::parse_str(
            "# space server three\n\
             server.id = 3\n\
             cseg.kind = uniform\n\
             cseg.region = 0,0,0, 100,100,100\n\
             cseg.perdim = 4,4,1\n\
             oseg.kind = craq\n\
             oseg.prefix = G\n\
             oseg.get_hosts = 10.0.0.1:4000, 10.0.0.2:4000\n\
             smq.kind = fifo\n\
             smq.queue_len = 64\n\
             migration.timeout = 45\n",
        )
        .unwrap();
        assert_eq!(cfg.server_id, ServerId(3));
        assert_eq!(cfg.cseg_perdim, (4, 4, 1));
        assert_eq!(cfg.oseg_prefix, b'G');
        assert_eq!(cfg.oseg_get_hosts.len(), 2);
        assert_eq!(cfg.smq_kind, SmqKind::Fifo);
        assert_eq!(cfg.migration_timeout, Duration::from_secs(45));
    }

    #[test]
    fn rejects_unknown_keys_and_missing_id() {
        assert!(matches!(
            ServerConfig::parse_str("server.id = 1\nsmq.bandwith = 5\n"),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(matches!(
            ServerConfig::parse_str("smq.queue_len = 5\n"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn rejects_null_server_id() {
        assert!(matches!(
            ServerConfig::parse_str("server.id = 0\n"),
            Err(ConfigError::BadValue { .. })
        ));
    }
}
