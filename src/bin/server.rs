//! Serves the demo catalog over TCP.

use anyhow::Result;
use bookstream::{BookService, Server, ServerConfig};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bookstream-server", version, about = "Serve SearchBooks over TCP")]
struct Args {
    /// Address to listen on.
    #[arg(short, long, env = "BOOKSTREAM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Largest accepted frame in bytes.
    #[arg(long, default_value_t = bookstream::transport::DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig {
        bind_addr: args.bind,
        max_frame_bytes: args.max_frame_bytes,
    };
    let handle = Server::bind(config, BookService::demo())?;
    info!(addr = %handle.local_addr(), "serving demo catalog");

    handle.wait();
    Ok(())
}
