//! Per-request proxying pipeline
//!
//! Wires the cache store and the collapse registry together: look the key
//! up, serve a hit, otherwise decide whether this request fetches from the
//! origin (directly, or as the collapse leader) or waits for another
//! request's fetch. The fetched response is sanitized, serialized, cached
//! when cacheable, and handed to every collapsed waiter.
//!
//! A leader releases its collapse token on every exit path, including
//! fetch failure, so followers are bounded by the origin timeout rather
//! than blocked forever.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Method, Response, StatusCode, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::{
    decode_response, encode_response, CacheStatus, CacheStore, KeyVars, StoredResponse,
};
use crate::logging::AccessLog;
use crate::proxy::collapse::FetchFailed;
use crate::proxy::headers::{append_forwarded_for, apply_overrides, strip_hop_by_hop};
use crate::routing::Location;

/// An inbound request reduced to what the pipeline needs
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
    /// Host header value
    pub host: String,
    pub version: Version,
}

/// Only GET and HEAD requests participate in caching
fn cacheable_request(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// Only sub-400 responses are written to the cache
fn cacheable_response(status: StatusCode) -> bool {
    status.as_u16() < 400
}

/// Run one request through the cache/collapse/fetch decision procedure.
///
/// Fills the access-log record's cache status, scheme, and origin timing;
/// the caller finishes the record from the returned response.
pub async fn handle(
    cache: &CacheStore,
    global_headers: &HashMap<String, String>,
    location: &Location,
    req: &ProxyRequest,
    log: &mut AccessLog,
) -> Response<Full<Bytes>> {
    log.scheme = location.origin.scheme().to_string();

    let vars = KeyVars {
        scheme: location.origin.scheme(),
        host: &req.host,
        uri: &req.path,
        querystring: req.query.as_deref().unwrap_or(""),
        method: req.method.as_str(),
    };
    let key = location.cache_key_for(&vars);

    let lookup = cache.get(&key).await;
    let mut status = lookup.status;
    let stale = lookup.data;

    if status == CacheStatus::Hit {
        match decode_response(&stale) {
            Ok(stored) => {
                log.cache_status = CacheStatus::Hit;
                return serve(stored);
            }
            Err(e) => {
                // Corrupt stored payload is a miss for this key
                warn!(key = %key, "Cached entry undecodable, refetching: {}", e);
                status = CacheStatus::Miss;
            }
        }
    }

    // MISS or EXPIRED from here on. The order of conditions matters: only
    // cacheable, non-bypassed requests take part in collapsing, and
    // `start` must be the last check so the token is claimed exactly when
    // this request will fetch.
    let collapsible = cacheable_request(&req.method) && !location.bypass;
    let is_leader = collapsible && location.collapse.start(&key);
    let payload: Bytes;

    if !collapsible || is_leader {
        let fetch_started = Instant::now();
        let origin_resp = match send_to_origin(location, req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(key = %key, "proxy error: {}", e);
                if is_leader {
                    location.collapse.stop(&key, Err(FetchFailed));
                }
                log.cache_status = status;
                return error_response(StatusCode::BAD_GATEWAY, "origin unreachable");
            }
        };
        log.origin_time = fetch_started.elapsed();

        let resp_status = origin_resp.status();
        let resp_version = origin_resp.version();
        let mut resp_headers = origin_resp.headers().clone();
        strip_hop_by_hop(&mut resp_headers);
        apply_overrides(&mut resp_headers, global_headers, &location.set_header);

        match origin_resp.bytes().await {
            Ok(body) => {
                payload = encode_response(resp_status, resp_version, &resp_headers, &body);
                if cacheable_request(&req.method)
                    && cacheable_response(resp_status)
                    && !location.bypass
                {
                    cache
                        .set(key.clone(), payload.clone(), location.expiry_from_now())
                        .await;
                }
                if is_leader {
                    location.collapse.stop(&key, Ok(payload.clone()));
                }
            }
            Err(e) => {
                // The fetch reached the origin but the response could not
                // be captured. With a stale copy on hand, serve it rather
                // than failing the request.
                if status == CacheStatus::Expired {
                    warn!(key = %key, "Origin response unreadable, serving stale: {}", e);
                    status = CacheStatus::Stale;
                    payload = stale;
                    if is_leader {
                        location.collapse.stop(&key, Ok(payload.clone()));
                    }
                } else {
                    warn!(key = %key, "Error reading origin response: {}", e);
                    if is_leader {
                        location.collapse.stop(&key, Err(FetchFailed));
                    }
                    log.cache_status = status;
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "origin response unreadable",
                    );
                }
            }
        }
    } else {
        match location.collapse.wait(&key).await {
            Ok(shared) => {
                debug!(key = %key, "Collapsed onto another request's fetch");
                payload = shared;
                status = CacheStatus::Collapsed;
            }
            Err(FetchFailed) => {
                log.cache_status = CacheStatus::Collapsed;
                return error_response(StatusCode::BAD_GATEWAY, "collapsed fetch failed");
            }
        }
    }

    log.cache_status = status;
    match decode_response(&payload) {
        Ok(stored) => serve(stored),
        Err(e) => {
            warn!(key = %key, "Undecodable response payload: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "response decode failed")
        }
    }
}

/// Forward the sanitized request to the location's origin
async fn send_to_origin(
    location: &Location,
    req: &ProxyRequest,
) -> crate::types::Result<reqwest::Response> {
    let url = location.origin_url_for(&req.path, req.query.as_deref());

    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    append_forwarded_for(&mut headers, req.remote_addr.ip());

    location
        .client
        .request(req.method.clone(), url)
        .headers(headers)
        .body(req.body.clone())
        .send()
        .await
        .map_err(|e| crate::types::WaypointError::Origin(e.to_string()))
}

/// Turn a decoded cached payload into the client-facing response
fn serve(stored: StoredResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(stored.status)
        .version(Version::HTTP_11);
    if let Some(headers) = builder.headers_mut() {
        *headers = stored.headers;
    }
    builder
        .body(Full::new(stored.body))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

/// JSON error body, matching the server's other error responses
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::LocationSpec;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Minimal origin: counts hits, records request headers, and answers
    /// with a fixed status/headers/body after an optional delay.
    struct Origin {
        addr: SocketAddr,
        hits: Arc<AtomicUsize>,
        seen_headers: Arc<Mutex<Option<HeaderMap>>>,
    }

    async fn spawn_origin(
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
        delay: Duration,
    ) -> Origin {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen_headers = Arc::new(Mutex::new(None));

        let task_hits = Arc::clone(&hits);
        let task_seen = Arc::clone(&seen_headers);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = Arc::clone(&task_hits);
                let seen = Arc::clone(&task_seen);
                let headers = headers.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        *seen.lock() = Some(req.headers().clone());
                        let headers = headers.clone();
                        async move {
                            tokio::time::sleep(delay).await;
                            let mut builder = Response::builder().status(status);
                            for (name, value) in headers {
                                builder = builder.header(name, value);
                            }
                            Ok::<_, Infallible>(
                                builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Origin {
            addr,
            hits,
            seen_headers,
        }
    }

    fn location_for(addr: SocketAddr, bypass: bool) -> Location {
        let spec = LocationSpec {
            origin: format!("http://{}", addr),
            cache_key: "$method:$uri".to_string(),
            expire: 30,
            set_header: HashMap::new(),
            bypass,
        };
        Location::from_spec(&spec, Duration::from_secs(5)).unwrap()
    }

    fn get_request(path: &str) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path: path.to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "127.0.0.1:54321".parse().unwrap(),
            host: "www.example.com".to_string(),
            version: Version::HTTP_11,
        }
    }

    fn store() -> CacheStore {
        CacheStore::new(64, None)
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn miss_then_hit_with_one_origin_fetch() {
        let origin = spawn_origin(StatusCode::OK, vec![], "origin body", Duration::ZERO).await;
        let location = location_for(origin.addr, false);
        let cache = store();
        let globals = HashMap::new();

        let mut log = AccessLog::begin();
        let first = handle(&cache, &globals, &location, &get_request("/foo"), &mut log).await;
        assert_eq!(log.cache_status, CacheStatus::Miss);
        assert!(log.origin_time > Duration::ZERO);
        let first_body = body_of(first).await;
        assert_eq!(&first_body[..], b"origin body");

        let mut log = AccessLog::begin();
        let second = handle(&cache, &globals, &location, &get_request("/foo"), &mut log).await;
        assert_eq!(log.cache_status, CacheStatus::Hit);
        assert_eq!(body_of(second).await, first_body);

        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_fetch() {
        let origin =
            spawn_origin(StatusCode::OK, vec![], "popular", Duration::from_millis(200)).await;
        let location = Arc::new(location_for(origin.addr, false));
        let cache = Arc::new(store());
        let barrier = Arc::new(tokio::sync::Barrier::new(10));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let location = Arc::clone(&location);
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let mut log = AccessLog::begin();
                let response =
                    handle(&cache, &HashMap::new(), &location, &get_request("/bar"), &mut log)
                        .await;
                (log.cache_status, body_of(response).await)
            }));
        }

        let mut collapsed = 0;
        let mut bodies = Vec::new();
        for handle in handles {
            let (status, body) = handle.await.unwrap();
            if status == CacheStatus::Collapsed {
                collapsed += 1;
            }
            bodies.push(body);
        }

        assert_eq!(origin.hits.load(Ordering::SeqCst), 1, "exactly one origin fetch");
        assert_eq!(collapsed, 9, "nine requests share the leader's fetch");
        assert!(bodies.iter().all(|b| &b[..] == b"popular"));
    }

    #[tokio::test]
    async fn hop_by_hop_headers_never_cross_the_proxy() {
        let origin = spawn_origin(
            StatusCode::OK,
            vec![("Keep-Alive", "timeout=5"), ("X-Origin-Tag", "keep-me")],
            "clean",
            Duration::ZERO,
        )
        .await;
        let location = location_for(origin.addr, false);
        let cache = store();

        let mut req = get_request("/clean");
        req.headers
            .insert("Connection", "keep-alive".parse().unwrap());
        req.headers
            .insert("Proxy-Authorization", "Basic xyz".parse().unwrap());
        req.headers.insert("X-Client-Tag", "keep-me".parse().unwrap());

        let mut log = AccessLog::begin();
        let response = handle(&cache, &HashMap::new(), &location, &req, &mut log).await;

        let forwarded = origin.seen_headers.lock().clone().unwrap();
        assert!(!forwarded.contains_key("proxy-authorization"));
        assert!(forwarded.contains_key("x-client-tag"));
        assert_eq!(forwarded.get("x-forwarded-for").unwrap(), "127.0.0.1");

        assert!(!response.headers().contains_key("keep-alive"));
        assert_eq!(response.headers().get("x-origin-tag").unwrap(), "keep-me");
    }

    #[tokio::test]
    async fn header_overrides_apply_location_over_global() {
        let origin = spawn_origin(StatusCode::OK, vec![], "x", Duration::ZERO).await;
        let mut location = location_for(origin.addr, false);
        location
            .set_header
            .insert("X-Served-By".to_string(), "location".to_string());
        let cache = store();

        let mut globals = HashMap::new();
        globals.insert("X-Served-By".to_string(), "global".to_string());
        globals.insert("Via".to_string(), "waypoint".to_string());

        let mut log = AccessLog::begin();
        let response = handle(&cache, &globals, &location, &get_request("/h"), &mut log).await;

        assert_eq!(response.headers().get("x-served-by").unwrap(), "location");
        assert_eq!(response.headers().get("via").unwrap(), "waypoint");
    }

    #[tokio::test]
    async fn bypass_fetches_every_time_and_never_caches() {
        let origin = spawn_origin(StatusCode::OK, vec![], "fresh", Duration::ZERO).await;
        let location = location_for(origin.addr, true);
        let cache = store();

        for _ in 0..2 {
            let mut log = AccessLog::begin();
            let response =
                handle(&cache, &HashMap::new(), &location, &get_request("/b"), &mut log).await;
            assert_eq!(log.cache_status, CacheStatus::Miss);
            assert_eq!(&body_of(response).await[..], b"fresh");
        }

        assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
        assert_eq!(cache.hot_len(), 0);
    }

    #[tokio::test]
    async fn post_requests_are_forwarded_but_not_cached() {
        let origin = spawn_origin(StatusCode::OK, vec![], "posted", Duration::ZERO).await;
        let location = location_for(origin.addr, false);
        let cache = store();

        let mut req = get_request("/p");
        req.method = Method::POST;
        req.body = Bytes::from_static(b"form=1");

        let mut log = AccessLog::begin();
        let response = handle(&cache, &HashMap::new(), &location, &req, &mut log).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache.hot_len(), 0);
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_responses_are_served_but_not_cached() {
        let origin =
            spawn_origin(StatusCode::INTERNAL_SERVER_ERROR, vec![], "boom", Duration::ZERO).await;
        let location = location_for(origin.addr, false);
        let cache = store();

        for _ in 0..2 {
            let mut log = AccessLog::begin();
            let response =
                handle(&cache, &HashMap::new(), &location, &get_request("/e"), &mut log).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(&body_of(response).await[..], b"boom");
        }

        // The 500 was never cached, so the origin was hit both times
        assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
        assert_eq!(cache.hot_len(), 0);
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_bad_gateway() {
        // Bind-then-drop leaves a port nothing is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let location = location_for(addr, false);
        let cache = store();

        let mut log = AccessLog::begin();
        let response =
            handle(&cache, &HashMap::new(), &location, &get_request("/dead"), &mut log).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(log.cache_status, CacheStatus::Miss);

        // The token was released, so a retry leads again rather than waiting
        let mut log = AccessLog::begin();
        let retry =
            handle(&cache, &HashMap::new(), &location, &get_request("/dead"), &mut log).await;
        assert_eq!(retry.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn expired_entries_trigger_a_refetch() {
        let origin = spawn_origin(StatusCode::OK, vec![], "v2", Duration::ZERO).await;
        let location = location_for(origin.addr, false);
        let cache = store();

        // Seed an already-expired entry for this key
        let old = encode_response(
            StatusCode::OK,
            Version::HTTP_11,
            &HeaderMap::new(),
            b"v1",
        );
        cache
            .set(
                "GET:/r".to_string(),
                old,
                chrono::Utc::now() - chrono::Duration::seconds(5),
            )
            .await;

        let mut log = AccessLog::begin();
        let response = handle(&cache, &HashMap::new(), &location, &get_request("/r"), &mut log).await;
        assert_eq!(log.cache_status, CacheStatus::Expired);
        assert_eq!(&body_of(response).await[..], b"v2");
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

        // The refreshed entry now serves as a hit
        let mut log = AccessLog::begin();
        handle(&cache, &HashMap::new(), &location, &get_request("/r"), &mut log).await;
        assert_eq!(log.cache_status, CacheStatus::Hit);
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_cached_payload_is_refetched() {
        let origin = spawn_origin(StatusCode::OK, vec![], "recovered", Duration::ZERO).await;
        let location = location_for(origin.addr, false);
        let cache = store();

        cache
            .set(
                "GET:/c".to_string(),
                Bytes::from_static(b"garbage, not a response"),
                chrono::Utc::now() + chrono::Duration::seconds(60),
            )
            .await;

        let mut log = AccessLog::begin();
        let response = handle(&cache, &HashMap::new(), &location, &get_request("/c"), &mut log).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"recovered");
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }
}
