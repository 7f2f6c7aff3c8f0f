//! Logging infrastructure for waypoint
//!
//! Per-request access records with operator-defined line formats.

pub mod access;

pub use access::{AccessLog, AccessLogger};
