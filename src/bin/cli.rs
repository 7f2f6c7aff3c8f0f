//! waypoint-cli - interactive client for the waypoint admin protocol

use anyhow::Context;
use clap::Parser;
use std::io::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

/// Interactive client for the waypoint admin interface
#[derive(Parser, Debug)]
#[command(name = "waypoint-cli")]
#[command(about = "Remote control client for a running waypoint daemon")]
struct CliArgs {
    /// Admin interface address
    #[arg(long, env = "WAYPOINT_ADMIN", default_value = "127.0.0.1:2042")]
    addr: String,

    /// Run a single command and exit instead of starting the prompt
    #[arg(long)]
    command: Option<String>,

    /// Display version information and exit
    #[arg(short = 'v', long)]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    if args.version {
        println!("waypoint-cli");
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("cannot connect to waypoint admin at {}", args.addr))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut server = BufReader::new(read_half);

    // The server greets on connect
    print!("{}", read_reply(&mut server).await?);

    if let Some(command) = args.command {
        write_half.write_all(format!("{}\n", command).as_bytes()).await?;
        print!("{}", read_reply(&mut server).await?);
        return Ok(());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("waypoint> ");
        std::io::stdout().flush()?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        if line.trim_start().starts_with("exit") {
            break;
        }

        write_half.write_all(format!("{}\n", line).as_bytes()).await?;
        let reply = read_reply(&mut server).await?;
        if reply.is_empty() {
            // Server closed the connection
            eprintln!("Connection closed by server.");
            break;
        }
        print!("{}", reply);
    }

    println!("Goodbye.");
    Ok(())
}

/// Read one reply: at least one line, then whatever is already buffered.
/// Replies may span several lines (e.g. `find pretty`), all flushed in one
/// write by the server.
async fn read_reply(server: &mut BufReader<OwnedReadHalf>) -> anyhow::Result<String> {
    let mut reply = String::new();
    loop {
        let mut line = String::new();
        let n = server.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        reply.push_str(&line);
        if server.buffer().is_empty() {
            break;
        }
    }
    Ok(reply)
}
