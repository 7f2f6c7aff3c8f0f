//! Access logging
//!
//! One record per proxied request, written to each configured sink as a
//! single line produced by substituting `$placeholders` in the sink's
//! format template. Sinks are append-only files behind a buffered writer;
//! with no sinks configured, records fall through to the diagnostic log.

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cache::CacheStatus;
use crate::config::LogConfig;

/// Log data for one request
#[derive(Debug, Clone)]
pub struct AccessLog {
    pub method: String,
    pub uri: String,
    pub querystring: String,
    pub host: String,
    pub remote_addr: String,
    /// Status line, e.g. "200 OK"
    pub status: String,
    pub status_code: u16,
    pub proto: String,
    pub scheme: String,
    /// Response body bytes sent
    pub size: u64,
    pub request_time: Duration,
    pub origin_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub cache_status: CacheStatus,
    pub referer: String,
    pub user_agent: String,
}

impl AccessLog {
    /// Start a record at request arrival; response fields are filled as
    /// the request progresses.
    pub fn begin() -> Self {
        Self {
            method: String::new(),
            uri: String::new(),
            querystring: String::new(),
            host: String::new(),
            remote_addr: String::new(),
            status: String::new(),
            status_code: 0,
            proto: String::new(),
            scheme: String::new(),
            size: 0,
            request_time: Duration::ZERO,
            origin_time: Duration::ZERO,
            timestamp: Utc::now(),
            cache_status: CacheStatus::Miss,
            referer: String::new(),
            user_agent: String::new(),
        }
    }

    /// Record the response outcome and close the request timer
    pub fn finish(&mut self, status_code: u16, status_line: String, size: u64) {
        self.status_code = status_code;
        self.status = status_line;
        self.size = size;
        self.request_time = (Utc::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
    }

    /// Render one line from a `$placeholder` format template
    pub fn format_line(&self, template: &str) -> String {
        let status_code = self.status_code.to_string();
        let size = self.size.to_string();
        let request_time = format!("{:?}", self.request_time);
        let origin_time = format!("{:?}", self.origin_time);
        let msec = self.timestamp.format("%Y-%m-%d_%H:%M:%S%.3f").to_string();

        let pairs: [(&str, &str); 16] = [
            ("$body_bytes_sent", &size),
            ("$remote_addr", &self.remote_addr),
            ("$hostname", &self.host),
            ("$cache_status", self.cache_status.as_str()),
            ("$http_host", &self.host),
            ("$request_method", &self.method),
            ("$origin_response_time", &origin_time),
            ("$server_protocol", &self.proto),
            ("$zone_query_string", &self.querystring),
            ("$http_referer", &self.referer),
            ("$scheme", &self.scheme),
            ("$status", &status_code),
            ("$msec", &msec),
            ("$uri", &self.uri),
            ("$http_user_agent", &self.user_agent),
            ("$request_time", &request_time),
        ];
        substitute(template, &pairs)
    }
}

/// Single-pass placeholder substitution: longest name wins at each `$`,
/// unknown `$`-text passes through, substituted values are not rescanned.
fn substitute(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut names: Vec<usize> = (0..pairs.len()).collect();
    names.sort_by_key(|&i| std::cmp::Reverse(pairs[i].0.len()));

    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    'outer: while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        for &i in &names {
            let (name, value) = pairs[i];
            if rest.starts_with(name) {
                out.push_str(value);
                rest = &rest[name.len()..];
                continue 'outer;
            }
        }
        out.push('$');
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}

struct Sink {
    writer: BufWriter<File>,
    format: String,
    path: String,
}

/// Writes access records to every configured sink
pub struct AccessLogger {
    sinks: Vec<Mutex<Sink>>,
}

impl AccessLogger {
    /// Open every "access" sink. A sink that cannot be opened is skipped
    /// with an error log; the remaining sinks still receive records.
    pub fn open(configs: &[LogConfig]) -> Self {
        let mut sinks = Vec::new();
        for config in configs {
            if config.kind != "access" {
                continue;
            }
            match OpenOptions::new().create(true).append(true).open(&config.location) {
                Ok(file) => {
                    info!("Access logging to {}", config.location);
                    sinks.push(Mutex::new(Sink {
                        writer: BufWriter::new(file),
                        format: config.format.clone(),
                        path: config.location.clone(),
                    }));
                }
                Err(e) => {
                    error!("Cannot open access log {}: {}", config.location, e);
                }
            }
        }
        Self { sinks }
    }

    /// Write one record to every sink
    pub async fn log(&self, record: &AccessLog) {
        if self.sinks.is_empty() {
            info!(
                target: "waypoint::access",
                method = %record.method,
                uri = %record.uri,
                host = %record.host,
                remote = %record.remote_addr,
                status = record.status_code,
                cache_status = record.cache_status.as_str(),
                bytes = record.size,
                "request served"
            );
            return;
        }

        for sink in &self.sinks {
            let mut sink = sink.lock().await;
            let line = record.format_line(&sink.format);
            if let Err(e) = writeln!(sink.writer, "{}", line) {
                warn!("Access log write to {} failed: {}", sink.path, e);
            }
            if let Err(e) = sink.writer.flush() {
                warn!("Access log flush to {} failed: {}", sink.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AccessLog {
        let mut log = AccessLog::begin();
        log.method = "GET".into();
        log.uri = "/foo".into();
        log.querystring = "a=1".into();
        log.host = "www.example.com".into();
        log.remote_addr = "203.0.113.7:4821".into();
        log.proto = "HTTP/1.1".into();
        log.scheme = "http".into();
        log.referer = "http://ref.example".into();
        log.user_agent = "curl/8.0".into();
        log.cache_status = CacheStatus::Hit;
        log.finish(200, "200 OK".into(), 512);
        log
    }

    #[test]
    fn fills_every_named_placeholder() {
        let line = record().format_line(
            "$remote_addr $http_host \"$request_method $uri\" $status $body_bytes_sent \
             $cache_status $scheme $server_protocol $zone_query_string \
             \"$http_referer\" \"$http_user_agent\"",
        );
        assert!(line.contains("203.0.113.7:4821"));
        assert!(line.contains("www.example.com"));
        assert!(line.contains("\"GET /foo\""));
        assert!(line.contains(" 200 "));
        assert!(line.contains(" 512 "));
        assert!(line.contains("HIT"));
        assert!(line.contains("http HTTP/1.1 a=1"));
        assert!(line.contains("\"http://ref.example\""));
        assert!(line.contains("\"curl/8.0\""));
        assert!(!line.contains('$'), "no placeholder should survive: {}", line);
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let line = record().format_line("$nonsense $uri");
        assert_eq!(line, "$nonsense /foo");
    }

    #[test]
    fn timing_placeholders_render_durations() {
        let mut log = record();
        log.origin_time = Duration::from_millis(42);
        let line = log.format_line("$origin_response_time|$request_time|$msec");
        assert!(line.starts_with("42ms|"));
        assert!(line.contains('_'), "msec timestamp is date_time formatted: {}", line);
    }
}
