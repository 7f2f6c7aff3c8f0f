//! Header sanitization for proxied traffic
//!
//! Hop-by-hop headers are connection-scoped and must not cross the proxy
//! boundary in either direction: they are stripped from the request before
//! it is forwarded to the origin, and from the origin's response before it
//! is cached or served. Forwarding metadata (X-Forwarded-For) and operator
//! header overrides are applied here as well.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

/// Hop-by-hop headers, removed when crossing the proxy.
/// http://www.w3.org/Protocols/rfc2616/rfc2616-sec13.html
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove every hop-by-hop header from `headers`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Append the client address to the X-Forwarded-For chain.
///
/// Prior proxy hops are retained as a comma-separated list, folded into a
/// single header, with this client appended last.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let client_ip = client_ip.to_string();
    let chain = {
        let prior: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if prior.is_empty() {
            client_ip
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        }
    };
    match HeaderValue::from_str(&chain) {
        Ok(value) => {
            headers.insert("x-forwarded-for", value);
        }
        Err(e) => warn!(error = %e, "Dropping unrepresentable X-Forwarded-For chain"),
    }
}

/// Apply operator header overrides to a response.
///
/// Global overrides first, then the location's, so a location wins when
/// both set the same header name.
pub fn apply_overrides(
    headers: &mut HeaderMap,
    global: &HashMap<String, String>,
    location: &HashMap<String, String>,
) {
    for source in [global, location] {
        for (name, value) in source {
            let parsed = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            );
            match parsed {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid header override"),
            }
        }
    }
}
