//! Waypoint - caching reverse proxy
//!
//! Waypoint sits in front of origin servers and serves cacheable HTTP
//! responses from a two-tier local store, collapsing concurrent fetches
//! for the same uncached resource into a single origin request.
//!
//! ## Services
//!
//! - **Proxy**: per-vhost reverse proxying with hop-by-hop sanitization
//! - **Cache**: bounded LRU hot tier over a persistent MongoDB cold tier
//! - **Collapse**: per-location single-flight registry for origin fetches
//! - **Admin**: line-oriented remote-control protocol on localhost

pub mod admin;
pub mod cache;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, WaypointError};

/// Crate version, surfaced by the CLI and the admin `version` command
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
