// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reader for the database process's persisted configuration file.
//!
//! The file is a block of NUL padding followed by `key=value` lines. Only
//! the keys needed to restore an agent identity are kept.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::agent::{AgentAddr, AgentIdentity, AgentRole};
use crate::error::{Error, Result};

/// Restored database process settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Advertised ip.
    pub local_ip: Option<String>,
    /// Zone name.
    pub zone: Option<String>,
    /// SQL port.
    pub mysql_port: Option<u16>,
    /// Internal rpc port.
    pub rpc_port: Option<u16>,
    /// Members of the cluster as `ip:rpc_port`.
    pub all_server_list: Vec<AgentAddr>,
}

impl ObserverConfig {
    /// Read and parse the file at `path`. A missing file yields `None`.
    pub async fn read(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), size = bytes.len(), "Read observer config");
                Self::parse(&bytes).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::unexpected(format!("read {}: {}", path.display(), e))),
        }
    }

    /// Parse raw file contents.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let text = String::from_utf8_lossy(&bytes[start..]);

        let values: HashMap<&str, &str> = text
            .lines()
            .map(|line| line.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let port = |key: &str| -> Result<Option<u16>> {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse()
                        .map_err(|_| Error::illegal_argument(format!("{} is not a port: {}", key, v)))
                })
                .transpose()
        };
        let text_value = |key: &str| values.get(key).filter(|v| !v.is_empty()).map(|v| v.to_string());

        let all_server_list = match values.get("all_server_list") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<AgentAddr>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            local_ip: text_value("local_ip"),
            zone: text_value("zone"),
            mysql_port: port("mysql_port")?,
            rpc_port: port("rpc_port")?,
            all_server_list,
        })
    }

    /// Identity of an agent on `agent_port` next to this database process,
    /// or `None` when the file lacks the ip.
    pub fn identity(&self, agent_port: u16, default_sql_port: u16) -> Option<AgentIdentity> {
        let ip = self.local_ip.clone()?;
        let mut identity =
            AgentIdentity::single(ip, agent_port, self.mysql_port.unwrap_or(default_sql_port));
        if let Some(zone) = &self.zone {
            identity.zone = zone.clone();
            if self.all_server_list.len() > 1 {
                identity.role = AgentRole::Follower;
            }
        }
        Some(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(body: &str) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }

    #[test]
    fn test_parse_strips_padding() {
        let config = ObserverConfig::parse(&file(
            "local_ip=10.0.0.1\nzone=z1\nmysql_port=2881\nrpc_port=2882\nall_server_list=10.0.0.1:2882,10.0.0.2:2882\nunknown=x\n",
        ))
        .unwrap();
        assert_eq!(config.local_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.zone.as_deref(), Some("z1"));
        assert_eq!(config.mysql_port, Some(2881));
        assert_eq!(config.rpc_port, Some(2882));
        assert_eq!(config.all_server_list.len(), 2);

        let identity = config.identity(2886, 3306).unwrap();
        assert_eq!(identity.sql_port, 2881);
        assert_eq!(identity.role, AgentRole::Follower);
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(ObserverConfig::parse(&file("mysql_port=abc\n")).is_err());
        let empty = ObserverConfig::parse(&file("")).unwrap();
        assert_eq!(empty, ObserverConfig::default());
        assert!(empty.identity(2886, 2881).is_none());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ObserverConfig::read(dir.path().join("observer.config.bin")).await.unwrap().is_none());
    }
}
