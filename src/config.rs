//! Configuration for waypoint
//!
//! CLI arguments and environment variable handling using clap, plus the
//! JSON config file formats: one global config and a directory of vhost
//! definition files that the routing table is built from.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::{Result, WaypointError};

/// Waypoint - caching reverse proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "waypoint")]
#[command(about = "Caching reverse proxy with request collapsing")]
pub struct Args {
    /// Unique node identifier for this proxy instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Path to the global config file
    #[arg(long, env = "WAYPOINT_CONF", default_value = "/etc/waypoint/waypoint.conf")]
    pub config: PathBuf,

    /// Root directory for vhost definition files (overrides the config file)
    #[arg(long, env = "VHOST_DIR")]
    pub vhost_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Display version information and exit
    #[arg(short = 'v', long)]
    pub version: bool,
}

/// Access-log sink definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Sink type; only "access" sinks are opened by the access logger
    #[serde(rename = "type")]
    pub kind: String,
    /// File path the sink appends to
    pub location: String,
    /// Line format with $placeholders (see logging::access)
    pub format: String,
}

/// Cache sizing and persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hot-tier capacity as an entry count
    #[serde(default = "default_hot_capacity")]
    pub hot_capacity: usize,
    /// MongoDB connection URI for the cold tier
    #[serde(default = "default_mongodb_uri")]
    pub mongodb_uri: String,
    /// MongoDB database name
    #[serde(default = "default_mongodb_db")]
    pub mongodb_db: String,
    /// Seconds between cold-tier purge sweeps
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_hot_capacity() -> usize {
    1024
}

fn default_mongodb_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_mongodb_db() -> String {
    "waypoint".to_string()
}

fn default_purge_interval() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: default_hot_capacity(),
            mongodb_uri: default_mongodb_uri(),
            mongodb_db: default_mongodb_db(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

/// Global config file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Address the HTTP listeners bind to (port comes from each vhost)
    #[serde(default = "default_server")]
    pub server: String,
    /// Localhost port for the admin line protocol
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Headers applied to every proxied response, before per-location overrides
    #[serde(default)]
    pub set_header: HashMap<String, String>,
    /// Root directory for vhost definition files
    #[serde(default = "default_vhost_path")]
    pub vhostpath: PathBuf,
    /// Access-log sinks
    #[serde(default)]
    pub logs: Vec<LogConfig>,
    /// Origin read/write timeout in seconds, applied to every location transport
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout_secs: u64,
}

fn default_server() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    2042
}

fn default_vhost_path() -> PathBuf {
    PathBuf::from("/etc/waypoint/vhosts")
}

fn default_origin_timeout() -> u64 {
    60
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            admin_port: default_admin_port(),
            cache: CacheConfig::default(),
            set_header: HashMap::new(),
            vhostpath: default_vhost_path(),
            logs: Vec::new(),
            origin_timeout_secs: default_origin_timeout(),
        }
    }
}

impl GlobalConfig {
    /// Load the global config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WaypointError::Config(format!("error reading {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            WaypointError::Config(format!("unable to decode {}: {}", path.display(), e))
        })
    }
}

/// One location inside a vhost definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSpec {
    /// Origin base URL, e.g. "http://backend:8080"
    pub origin: String,
    /// Cache-key template with $placeholders
    #[serde(default = "default_cache_key")]
    pub cache_key: String,
    /// TTL for cached responses, in seconds
    #[serde(default = "default_expire")]
    pub expire: u64,
    /// Response header overrides for this location
    #[serde(default)]
    pub set_header: HashMap<String, String>,
    /// Disables caching (and collapsing) for this location
    #[serde(default, rename = "cache_bypass")]
    pub bypass: bool,
}

fn default_cache_key() -> String {
    "$host$uri".to_string()
}

fn default_expire() -> u64 {
    300
}

/// One vhost definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhostFile {
    /// Port this vhost listens on
    pub port: u16,
    /// Hostnames served by this vhost
    pub vhosts: Vec<String>,
    /// URL path prefix -> location config
    pub location: HashMap<String, LocationSpec>,
}

impl VhostFile {
    /// Parse a single vhost definition file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WaypointError::Config(format!("error reading {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            WaypointError::Config(format!("unable to decode {}: {}", path.display(), e))
        })
    }
}

/// Recursively collect vhost definitions under `dir`.
///
/// A file that fails to parse is skipped with a warning so one malformed
/// vhost cannot prevent the rest of the table from loading.
pub fn load_vhost_files(dir: &Path) -> Result<Vec<VhostFile>> {
    let mut out = Vec::new();
    collect_vhost_files(dir, &mut out)?;
    Ok(out)
}

fn collect_vhost_files(dir: &Path, out: &mut Vec<VhostFile>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| WaypointError::Config(format!("error reading {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(WaypointError::Io)?;
        let path = entry.path();
        if path.is_dir() {
            collect_vhost_files(&path, out)?;
        } else {
            match VhostFile::load(&path) {
                Ok(vhost) => {
                    tracing::info!("Loaded vhost config from {}", path.display());
                    out.push(vhost);
                }
                Err(e) => {
                    tracing::warn!("Skipping vhost file {}: {}", path.display(), e);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vhost_definition() {
        let raw = r#"{
            "port": 8080,
            "vhosts": ["www.example.com", "example.com"],
            "location": {
                "/": {
                    "origin": "http://backend:9000",
                    "cache_key": "$method:$uri",
                    "expire": 30,
                    "set_header": {"X-Served-By": "waypoint"},
                    "cache_bypass": false
                },
                "/nocache/": {
                    "origin": "http://backend:9000",
                    "cache_bypass": true
                }
            }
        }"#;

        let vhost: VhostFile = serde_json::from_str(raw).unwrap();
        assert_eq!(vhost.port, 8080);
        assert_eq!(vhost.vhosts.len(), 2);

        let root = &vhost.location["/"];
        assert_eq!(root.origin, "http://backend:9000");
        assert_eq!(root.cache_key, "$method:$uri");
        assert_eq!(root.expire, 30);
        assert!(!root.bypass);

        let nocache = &vhost.location["/nocache/"];
        assert!(nocache.bypass);
        assert_eq!(nocache.cache_key, "$host$uri");
        assert_eq!(nocache.expire, 300);
    }

    #[test]
    fn parses_global_config_with_defaults() {
        let raw = r#"{
            "server": "127.0.0.1",
            "cache": {"hot_capacity": 64},
            "set_header": {"Via": "waypoint"},
            "logs": [
                {"type": "access", "location": "/var/log/waypoint/access.log",
                 "format": "$remote_addr $request_method $uri $status $cache_status"}
            ]
        }"#;

        let cfg: GlobalConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.server, "127.0.0.1");
        assert_eq!(cfg.admin_port, 2042);
        assert_eq!(cfg.cache.hot_capacity, 64);
        assert_eq!(cfg.cache.mongodb_db, "waypoint");
        assert_eq!(cfg.logs.len(), 1);
        assert_eq!(cfg.origin_timeout_secs, 60);
    }

    #[test]
    fn malformed_vhost_files_are_skipped() {
        let dir = std::env::temp_dir().join(format!("waypoint-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("good.json"),
            r#"{"port": 80, "vhosts": ["a.test"], "location": {"/": {"origin": "http://o"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("bad.json"), "{not json").unwrap();

        let loaded = load_vhost_files(&dir).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].vhosts[0], "a.test");

        std::fs::remove_dir_all(&dir).ok();
    }
}
