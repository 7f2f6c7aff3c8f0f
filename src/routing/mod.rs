//! Routing data model
//!
//! A `Location` is the routable unit: one origin, one cache policy, one
//! collapse registry, one outbound transport. Locations hang off
//! `VirtualHost`s, and the `RoutingTable` resolves an inbound
//! (port, hostname, path) to the location with the longest matching path
//! prefix. The table is immutable once built; a reload builds a fresh
//! table and swaps the shared handle, so in-flight requests never observe
//! a half-updated table.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::cache::{render_cache_key, KeyVars};
use crate::config::{GlobalConfig, LocationSpec, VhostFile};
use crate::proxy::CollapseRegistry;
use crate::types::{Result, WaypointError};

/// Shared handle to the current routing table; reload replaces the inner Arc
pub type SharedRoutingTable = Arc<RwLock<Arc<RoutingTable>>>;

/// One routable unit: origin, cache policy, collapse registry, transport
#[derive(Debug)]
pub struct Location {
    /// Origin base URL
    pub origin: Url,
    /// Cache-key template
    pub cache_key: String,
    /// TTL for cached responses, in seconds
    pub expire_secs: u64,
    /// Response header overrides
    pub set_header: HashMap<String, String>,
    /// Disables caching and collapsing entirely
    pub bypass: bool,
    /// In-flight fetch registry, exclusive to this location
    pub collapse: CollapseRegistry,
    /// Outbound transport, exclusive to this location
    pub client: reqwest::Client,
}

impl Location {
    /// Build a location from its config. Fails when the origin URL does
    /// not parse; the caller drops just this location.
    pub fn from_spec(spec: &LocationSpec, origin_timeout: Duration) -> Result<Self> {
        let origin = Url::parse(&spec.origin)
            .map_err(|e| WaypointError::Config(format!("bad origin '{}': {}", spec.origin, e)))?;
        // Redirects pass through to the client untouched
        let client = reqwest::Client::builder()
            .timeout(origin_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WaypointError::Config(format!("transport build failed: {}", e)))?;

        Ok(Self {
            origin,
            cache_key: spec.cache_key.clone(),
            expire_secs: spec.expire,
            set_header: spec.set_header.clone(),
            bypass: spec.bypass,
            collapse: CollapseRegistry::new(),
            client,
        })
    }

    /// Render this location's cache key for one request
    pub fn cache_key_for(&self, vars: &KeyVars<'_>) -> String {
        render_cache_key(&self.cache_key, vars)
    }

    /// Absolute expiry for an entry cached right now
    pub fn expiry_from_now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.expire_secs as i64)
    }

    /// Rewrite a request path/query onto the origin base URL
    pub fn origin_url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.origin.clone();
        url.set_path(&single_joining_slash(self.origin.path(), path));
        url.set_query(query);
        url
    }
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// One vhost: a port, its hostnames, and its locations ordered for
/// longest-prefix matching
pub struct VirtualHost {
    pub port: u16,
    pub hostnames: Vec<String>,
    /// (path prefix, location), sorted by prefix length descending
    locations: Vec<(String, Arc<Location>)>,
    /// Original definition, kept for the admin `find` dump
    pub spec: VhostFile,
}

impl VirtualHost {
    fn resolve(&self, path: &str) -> Option<Arc<Location>> {
        self.locations
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, location)| Arc::clone(location))
    }
}

/// The full (port, hostname) -> vhost mapping
pub struct RoutingTable {
    vhosts: HashMap<(u16, String), Arc<VirtualHost>>,
}

impl RoutingTable {
    /// Build a table from loaded vhost definitions.
    ///
    /// A location whose origin fails to parse is dropped with an error log;
    /// the rest of its vhost still routes.
    pub fn build(files: &[VhostFile], global: &GlobalConfig) -> Self {
        let origin_timeout = Duration::from_secs(global.origin_timeout_secs);
        let mut vhosts = HashMap::new();

        for file in files {
            let mut locations = Vec::new();
            for (prefix, spec) in &file.location {
                match Location::from_spec(spec, origin_timeout) {
                    Ok(location) => locations.push((prefix.clone(), Arc::new(location))),
                    Err(e) => {
                        error!(prefix = %prefix, "Dropping location: {}", e);
                    }
                }
            }
            // Longest prefix first, so "/api/" beats "/"
            locations.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

            let vhost = Arc::new(VirtualHost {
                port: file.port,
                hostnames: file.vhosts.clone(),
                locations,
                spec: file.clone(),
            });
            for hostname in &file.vhosts {
                vhosts.insert((file.port, hostname.clone()), Arc::clone(&vhost));
            }
        }

        info!("Routing table built: {} (port, hostname) routes", vhosts.len());
        Self { vhosts }
    }

    /// Resolve a request to its location.
    ///
    /// The Host header may carry a port suffix; it is ignored in favor of
    /// the listener's port.
    pub fn resolve(&self, port: u16, host: &str, path: &str) -> Result<Arc<Location>> {
        let hostname = host.rsplit_once(':').map_or(host, |(h, _)| h);
        self.vhosts
            .get(&(port, hostname.to_string()))
            .and_then(|vhost| vhost.resolve(path))
            .ok_or_else(|| WaypointError::NoRoute {
                host: host.to_string(),
                path: path.to_string(),
            })
    }

    /// Distinct ports the proxy must listen on
    pub fn ports(&self) -> BTreeSet<u16> {
        self.vhosts.keys().map(|(port, _)| *port).collect()
    }

    /// Deduplicated vhosts, for the admin dump
    pub fn vhost_specs(&self) -> Vec<&VhostFile> {
        let mut seen = BTreeSet::new();
        let mut specs = Vec::new();
        for vhost in self.vhosts.values() {
            if let Some(first) = vhost.hostnames.first() {
                if seen.insert((vhost.port, first.clone())) {
                    specs.push(&vhost.spec);
                }
            }
        }
        specs
    }

    /// Look up a vhost definition by hostname, for the admin `find` command
    pub fn find_spec(&self, hostname: &str) -> Option<&VhostFile> {
        self.vhosts
            .iter()
            .find(|((_, name), _)| name == hostname)
            .map(|(_, vhost)| &vhost.spec)
    }

    /// Compact every location's collapse registry, returning targets removed
    pub fn compact_registries(&self) -> usize {
        let mut seen: BTreeSet<usize> = BTreeSet::new();
        let mut removed = 0;
        for vhost in self.vhosts.values() {
            for (_, location) in &vhost.locations {
                // Vhosts alias the same Arc under several hostnames
                if seen.insert(Arc::as_ptr(location) as usize) {
                    removed += location.collapse.compact();
                }
            }
        }
        removed
    }

    /// Total in-flight collapsed fetches across all locations
    pub fn in_flight_total(&self) -> usize {
        let mut seen: BTreeSet<usize> = BTreeSet::new();
        let mut total = 0;
        for vhost in self.vhosts.values() {
            for (_, location) in &vhost.locations {
                if seen.insert(Arc::as_ptr(location) as usize) {
                    total += location.collapse.in_flight();
                }
            }
        }
        total
    }

    /// Total locations, for admin stats
    pub fn location_count(&self) -> usize {
        let mut seen: BTreeSet<usize> = BTreeSet::new();
        for vhost in self.vhosts.values() {
            for (_, location) in &vhost.locations {
                seen.insert(Arc::as_ptr(location) as usize);
            }
        }
        seen.len()
    }
}
