//! Proxying
//!
//! Request collapsing, header sanitization, and the per-request pipeline
//! that ties them to the cache store.

pub mod collapse;
pub mod headers;
pub mod pipeline;

pub use collapse::{CollapseRegistry, Delivery, FetchFailed};
pub use headers::HOP_BY_HOP_HEADERS;
pub use pipeline::{handle, ProxyRequest};
