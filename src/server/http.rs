//! HTTP server implementation
//!
//! One listener per distinct configured port, each multiplexing the vhosts
//! that share it by hostname and path prefix. Uses hyper http1 with
//! TokioIo for async handling; every accepted connection gets its own
//! task, and every request runs the proxy pipeline against the shared
//! server context.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as _, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::cache::CacheStore;
use crate::config::{load_vhost_files, Args, GlobalConfig};
use crate::logging::{AccessLog, AccessLogger};
use crate::proxy::{self, ProxyRequest};
use crate::routing::{RoutingTable, SharedRoutingTable};
use crate::types::{Result, WaypointError};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state, constructed once at startup and passed by
/// reference into every request task. There is no ambient global state.
pub struct AppState {
    pub args: Args,
    pub config: GlobalConfig,
    pub cache: Arc<CacheStore>,
    pub routing: SharedRoutingTable,
    pub access_log: AccessLogger,
}

impl AppState {
    pub fn new(
        args: Args,
        config: GlobalConfig,
        cache: Arc<CacheStore>,
        routing_table: RoutingTable,
    ) -> Self {
        let access_log = AccessLogger::open(&config.logs);
        Self {
            args,
            config,
            cache,
            routing: Arc::new(RwLock::new(Arc::new(routing_table))),
            access_log,
        }
    }

    /// Snapshot of the current routing table
    pub async fn routing_table(&self) -> Arc<RoutingTable> {
        Arc::clone(&*self.routing.read().await)
    }

    /// Rebuild the routing table from the vhost directory and swap it in.
    /// In-flight requests keep the table they resolved against.
    pub async fn reload_routing(&self) -> Result<usize> {
        let dir = self
            .args
            .vhost_dir
            .clone()
            .unwrap_or_else(|| self.config.vhostpath.clone());
        let files = load_vhost_files(&dir)?;
        let table = RoutingTable::build(&files, &self.config);
        let count = table.location_count();
        *self.routing.write().await = Arc::new(table);
        info!("Routing table reloaded: {} locations", count);
        Ok(count)
    }
}

/// Bind one listener per configured port and serve until aborted
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let ports = state.routing.read().await.ports();
    if ports.is_empty() {
        return Err(WaypointError::Config(
            "no vhosts loaded, nothing to listen on".into(),
        ));
    }

    let mut handles = Vec::new();
    for port in ports {
        let addr = format!("{}:{}", state.config.server, port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy listening on {}", addr);

        let state = Arc::clone(&state);
        handles.push(tokio::spawn(serve_port(state, listener, port)));
    }

    info!("Proxy server started");
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Listener task failed: {:?}", e);
        }
    }
    Ok(())
}

async fn serve_port(state: Arc<AppState>, listener: TcpListener, port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, port, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Resolve an inbound request and run it through the proxy pipeline
async fn handle_request(
    state: Arc<AppState>,
    port: u16,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let mut log = AccessLog::begin();
    log.method = req.method().to_string();
    log.uri = req.uri().path().to_string();
    log.querystring = req.uri().query().unwrap_or("").to_string();
    log.proto = format!("{:?}", req.version());
    log.remote_addr = addr.to_string();
    log.host = header_str(&req, "host");
    log.referer = header_str(&req, "referer");
    log.user_agent = header_str(&req, "user-agent");

    let routing = state.routing_table().await;
    let location = match routing.resolve(port, &log.host, &log.uri) {
        Ok(location) => location,
        Err(e) => {
            let response = no_route_response(&log.uri);
            finish_and_log(&state, &mut log, &response).await;
            tracing::debug!("{}", e);
            return Ok(to_boxed(response));
        }
    };

    let method = req.method().clone();
    let version = req.version();
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let proxy_req = ProxyRequest {
        method,
        path: log.uri.clone(),
        query: if log.querystring.is_empty() {
            None
        } else {
            Some(log.querystring.clone())
        },
        headers: parts.headers,
        body,
        remote_addr: addr,
        host: log.host.clone(),
        version,
    };

    let response = proxy::handle(
        &state.cache,
        &state.config.set_header,
        &location,
        &proxy_req,
        &mut log,
    )
    .await;

    finish_and_log(&state, &mut log, &response).await;
    Ok(to_boxed(response))
}

async fn finish_and_log(state: &AppState, log: &mut AccessLog, response: &Response<Full<Bytes>>) {
    let status = response.status();
    let status_line = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let size = response.body().size_hint().exact().unwrap_or(0);
    log.finish(status.as_u16(), status_line, size);
    state.access_log.log(log).await;
}

fn header_str(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// No vhost/location matches the request
fn no_route_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "no vhost/location is configured for this host and path"
    });

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
