//! Administrative remote-control interface
//!
//! A line-oriented TCP protocol on a localhost port: one command per line,
//! one reply terminated by CRLF, connection held open until the client
//! disconnects. `waypoint-cli` is the interactive client.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::server::AppState;
use crate::types::Result;

/// Command names and usage strings, for `help`
const COMMANDS: [(&str, &str); 5] = [
    ("find", "View vhost configs matching the given hostnames (find [pretty] [hostname...])"),
    ("stats", "Display cache and collapse-registry counters"),
    ("reload", "Rebuild the routing table from the vhost directory"),
    ("version", "Display version information"),
    ("help", "Display help information for commands"),
];

/// Listen for admin clients on the configured localhost port
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", state.config.admin_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Admin interface listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(state, stream, peer).await {
                        error!("Admin connection error from {}: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting admin connection: {:?}", e);
            }
        }
    }
}

async fn handle_client(
    state: Arc<AppState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    info!("Admin connection established: {}", peer);
    let local = stream.local_addr()?;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(format!("Connection established to {}\n", local).as_bytes())
        .await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match handle_command(&state, line.trim()).await {
            Ok(reply) => reply,
            Err(message) => message,
        };
        write_half
            .write_all(format!("{}\r\n", reply.trim_end()).as_bytes())
            .await?;
    }

    info!("Admin connection closed from {}", peer);
    Ok(())
}

/// Dispatch one command line; `Err` carries the error text for the client
pub async fn handle_command(
    state: &AppState,
    line: &str,
) -> std::result::Result<String, String> {
    let mut tokens = line.split_whitespace();
    let Some(command) = tokens.next() else {
        return Ok(String::new());
    };
    let context: Vec<&str> = tokens.collect();

    match command {
        "help" | "h" => Ok(help_text(&context)),
        "find" => find_vhosts(state, &context).await,
        "stats" => Ok(stats_text(state).await),
        "reload" => match state.reload_routing().await {
            Ok(count) => Ok(format!("Reloaded routing table: {} locations", count)),
            Err(e) => Err(format!("Reload failed: {}", e)),
        },
        "version" => Ok(format!(
            "waypoint {} (commit {})",
            crate::VERSION,
            option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown")
        )),
        _ => Err("Command not found.".to_string()),
    }
}

fn help_text(context: &[&str]) -> String {
    let mut reply = String::new();
    for (name, usage) in COMMANDS {
        if context.is_empty() || context.contains(&name) {
            reply.push_str(&format!("{}\t{}\r\n", name, usage));
        }
    }
    reply
}

async fn find_vhosts(
    state: &AppState,
    context: &[&str],
) -> std::result::Result<String, String> {
    let (pretty, hostnames) = match context.first() {
        Some(&"pretty") => (true, &context[1..]),
        _ => (false, context),
    };

    let routing = state.routing_table().await;
    let mut reply = String::new();

    if hostnames.is_empty() {
        for spec in routing.vhost_specs() {
            reply.push_str(&dump(spec, pretty)?);
            reply.push('\n');
        }
    } else {
        for hostname in hostnames {
            if let Some(spec) = routing.find_spec(hostname) {
                reply.push_str(&dump(spec, pretty)?);
                reply.push('\n');
            }
        }
    }
    Ok(reply)
}

fn dump(
    spec: &crate::config::VhostFile,
    pretty: bool,
) -> std::result::Result<String, String> {
    let dumped = if pretty {
        serde_json::to_string_pretty(spec)
    } else {
        serde_json::to_string(spec)
    };
    dumped.map_err(|e| format!("Serialization failed: {}", e))
}

async fn stats_text(state: &AppState) -> String {
    let routing = state.routing_table().await;
    format!(
        "hot_entries: {}\r\ncold_tier: {}\r\nlocations: {}\r\nin_flight_fetches: {}",
        state.cache.hot_len(),
        if state.cache.has_cold_tier() { "attached" } else { "disabled" },
        routing.location_count(),
        routing.in_flight_total(),
    )
}
