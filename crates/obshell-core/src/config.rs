// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent home directory
    pub home: PathBuf,
    /// Advertised agent ip
    pub ip: String,
    /// HTTP (rpc) port
    pub port: u16,
    /// Database SQL port
    pub sql_port: u16,
    /// MySQL URL of the shared cluster store, if any
    pub cluster_database_url: Option<String>,
    /// Executor pool worker count
    pub worker_count: usize,
    /// Executor waiting queue capacity
    pub waiting_queue_size: usize,
    /// Lifetime of outgoing authentication headers
    pub header_ttl: Duration,
    /// Sliding session expiry
    pub session_ttl: Duration,
    /// Maximum number of live sessions
    pub session_cap: usize,
    /// Synchroniser batch size and retry-list bound
    pub sync_buffer: usize,
    /// Maintainer re-evaluation period
    pub coordinator_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::from("."),
            ip: "127.0.0.1".to_string(),
            port: 2886,
            sql_port: 2881,
            cluster_database_url: None,
            worker_count: 8,
            waiting_queue_size: 1024,
            header_ttl: Duration::from_secs(10),
            session_ttl: Duration::from_secs(3600),
            session_cap: 1024,
            sync_buffer: 10_000,
            coordinator_interval: Duration::from_millis(1000),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    invalid: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Invalid(name, invalid))
        }
        _ => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `OBSHELL_HOME`: agent home (default: `.`)
    /// - `OBSHELL_IP`: advertised ip (default: 127.0.0.1)
    /// - `OBSHELL_PORT`: HTTP port (default: 2886)
    /// - `OBSHELL_SQL_PORT`: database port (default: 2881)
    /// - `OBSHELL_CLUSTER_DATABASE_URL`: cluster store URL (default: unset)
    /// - `OBSHELL_WORKER_COUNT`: executor workers (default: 8)
    /// - `OBSHELL_WAITING_QUEUE_SIZE`: waiting queue capacity (default: 1024)
    /// - `OBSHELL_HEADER_TTL_SECS`: header lifetime (default: 10)
    /// - `OBSHELL_SESSION_TTL_SECS`: session expiry (default: 3600)
    /// - `OBSHELL_SESSION_CAP`: session cap (default: 1024)
    /// - `OBSHELL_SYNC_BUFFER`: synchroniser bound (default: 10000)
    /// - `OBSHELL_COORDINATOR_INTERVAL_MS`: maintainer period (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let home = std::env::var("OBSHELL_HOME")
            .map(PathBuf::from)
            .unwrap_or(defaults.home);
        let ip = std::env::var("OBSHELL_IP").unwrap_or(defaults.ip);
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid("OBSHELL_IP", "must be an ip address"));
        }

        let port = parse_var("OBSHELL_PORT", defaults.port, "must be a valid port number")?;
        let sql_port = parse_var(
            "OBSHELL_SQL_PORT",
            defaults.sql_port,
            "must be a valid port number",
        )?;
        let cluster_database_url = std::env::var("OBSHELL_CLUSTER_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let worker_count: usize = parse_var(
            "OBSHELL_WORKER_COUNT",
            defaults.worker_count,
            "must be a positive integer",
        )?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "OBSHELL_WORKER_COUNT",
                "must be a positive integer",
            ));
        }
        let waiting_queue_size: usize = parse_var(
            "OBSHELL_WAITING_QUEUE_SIZE",
            defaults.waiting_queue_size,
            "must be a positive integer",
        )?;
        if waiting_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "OBSHELL_WAITING_QUEUE_SIZE",
                "must be a positive integer",
            ));
        }

        let header_ttl_secs: u64 =
            parse_var("OBSHELL_HEADER_TTL_SECS", 10, "must be a number of seconds")?;
        let session_ttl_secs: u64 =
            parse_var("OBSHELL_SESSION_TTL_SECS", 3600, "must be a number of seconds")?;
        let session_cap = parse_var(
            "OBSHELL_SESSION_CAP",
            defaults.session_cap,
            "must be a positive integer",
        )?;
        let sync_buffer = parse_var(
            "OBSHELL_SYNC_BUFFER",
            defaults.sync_buffer,
            "must be a positive integer",
        )?;
        let coordinator_interval_ms: u64 = parse_var(
            "OBSHELL_COORDINATOR_INTERVAL_MS",
            1000,
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            home,
            ip,
            port,
            sql_port,
            cluster_database_url,
            worker_count,
            waiting_queue_size,
            header_ttl: Duration::from_secs(header_ttl_secs),
            session_ttl: Duration::from_secs(session_ttl_secs),
            session_cap,
            sync_buffer,
            coordinator_interval: Duration::from_millis(coordinator_interval_ms),
        })
    }

    /// Path of the local SQLite store.
    pub fn local_db_path(&self) -> PathBuf {
        self.home.join("run").join("obshell.db")
    }

    /// Path of the SQLite cluster store used when no cluster database is
    /// configured.
    pub fn cluster_db_path(&self) -> PathBuf {
        self.home.join("run").join("cluster.db")
    }

    /// Path of the administrative Unix socket.
    pub fn socket_path(&self) -> PathBuf {
        self.home.join("run").join("obshell.sock")
    }

    /// Path of the observer configuration file.
    pub fn observer_config_path(&self) -> PathBuf {
        self.home.join("etc").join("observer.config.bin")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
