use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use loka_shared::ServerId;

use crate::error::ConfigError;

/// Static `ServerId -> address` table, loaded once at startup from a text
/// file with one `id<TAB>ip:port` entry per line.
#[derive(Clone, Debug, Default)]
pub struct ServerIdMap {
    entries: HashMap<ServerId, SocketAddr>,
}

impl ServerIdMap {
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |why: &str| {
                ConfigError::ServerMap(format!("line {}: {}", idx + 1, why))
            };
            let (id_part, addr_part) = line
                .split_once('\t')
                .ok_or_else(|| err("expected `id<TAB>ip:port`"))?;
            let id: u32 = id_part
                .trim()
                .parse()
                .map_err(|_| err("bad server id"))?;
            if id == 0 {
                return Err(err("server id 0 is reserved"));
            }
            let addr: SocketAddr = addr_part
                .trim()
                .parse()
                .map_err(|_| err("bad socket address"))?;
            if entries.insert(ServerId(id), addr).is_some() {
                return Err(err("duplicate server id"));
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ServerMap(format!("{}: {}", path.display(), e)))?;
        Self::parse_str(&text)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (ServerId, SocketAddr)>) -> Self {
        Self { entries: entries.into_iter().collect() }
    }

    pub fn lookup(&self, id: ServerId) -> Option<SocketAddr> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
