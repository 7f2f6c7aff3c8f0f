//! Cache entries and the serialized response format
//!
//! A cached payload is a full HTTP response flattened into one byte
//! sequence: status line, headers, a blank line, then the body. The store
//! treats it as opaque; encoding/decoding lives here so the pipeline and
//! both tiers agree on the format.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{StatusCode, Version};

use crate::types::{Result, WaypointError};

/// One cached response payload with its absolute expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serialized HTTP response (status line, headers, body)
    pub data: Bytes,
    /// Absolute expiry; an entry past this is stale but may still be present
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: Bytes, expires_at: DateTime<Utc>) -> Self {
        Self { data, expires_at }
    }

    /// Whether the entry's expiry has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// A response decoded back out of a cached payload
#[derive(Debug)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(raw: &str) -> Version {
    match raw {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2.0" | "HTTP/2" => Version::HTTP_2,
        _ => Version::HTTP_11,
    }
}

/// Flatten a response into the cached wire form
pub fn encode_response(
    status: StatusCode,
    version: Version,
    headers: &HeaderMap,
    body: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 256);
    buf.put_slice(version_str(version).as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

/// Parse a cached payload back into a response.
///
/// Any structural problem is a `Decode` error; callers treat that as a
/// miss (corrupt stored entry) or fall back to stale data.
pub fn decode_response(data: &Bytes) -> Result<StoredResponse> {
    let split = find_blank_line(data)
        .ok_or_else(|| WaypointError::Decode("missing header/body separator".into()))?;
    let head = &data[..split];
    let body = data.slice(split + 4..);

    let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let status_line = lines
        .next()
        .ok_or_else(|| WaypointError::Decode("empty payload".into()))?;
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| WaypointError::Decode("status line is not UTF-8".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parse_version(
        parts
            .next()
            .ok_or_else(|| WaypointError::Decode("missing HTTP version".into()))?,
    );
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| WaypointError::Decode("bad status code".into()))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| WaypointError::Decode("malformed header line".into()))?;
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|e| WaypointError::Decode(format!("bad header name: {}", e)))?;
        let value = trim_ascii(&line[colon + 1..]);
        let value = HeaderValue::from_bytes(value)
            .map_err(|e| WaypointError::Decode(format!("bad header value: {}", e)))?;
        headers.append(name, value);
    }

    Ok(StoredResponse {
        status,
        version,
        headers,
        body,
    })
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn trim_ascii(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn encode_then_decode_preserves_response() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let encoded = encode_response(StatusCode::OK, Version::HTTP_11, &headers, b"hello body");
        let decoded = decode_response(&encoded).unwrap();

        assert_eq!(decoded.status, StatusCode::OK);
        assert_eq!(decoded.version, Version::HTTP_11);
        assert_eq!(decoded.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(decoded.headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(&decoded.body[..], b"hello body");
    }

    #[test]
    fn body_may_contain_blank_lines() {
        let headers = HeaderMap::new();
        let body = b"first\r\n\r\nsecond";
        let encoded = encode_response(StatusCode::OK, Version::HTTP_11, &headers, body);
        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(&decoded.body[..], body);
    }

    #[test]
    fn corrupt_payload_is_a_decode_error() {
        let garbage = Bytes::from_static(b"not an http response at all");
        assert!(decode_response(&garbage).is_err());

        let bad_status = Bytes::from_static(b"HTTP/1.1 banana\r\n\r\nbody");
        assert!(decode_response(&bad_status).is_err());
    }

    #[test]
    fn entry_expiry_check() {
        let fresh = CacheEntry::new(Bytes::from_static(b"x"), Utc::now() + Duration::seconds(30));
        assert!(!fresh.is_expired());

        let stale = CacheEntry::new(Bytes::from_static(b"x"), Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());
    }
}
