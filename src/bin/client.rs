//! Runs one `SearchBooks` call and prints each result.

use anyhow::{Context, Result};
use bookstream::{BookClient, BookFilter, ClientConfig};
use clap::Parser;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bookstream-client", version, about = "Search books on a bookstream server")]
struct Args {
    /// Server address.
    #[arg(short, long, env = "BOOKSTREAM_TARGET", default_value = "localhost:9090")]
    target: String,

    /// Match on book id.
    #[arg(long, default_value = "")]
    id: String,

    /// Match on exact title.
    #[arg(long, default_value = "")]
    name: String,

    /// Match on page count (0 = any).
    #[arg(long, default_value_t = 0)]
    page_count: u32,

    /// Match on author id.
    #[arg(long, default_value = "")]
    author_id: String,

    /// Stop after this many results.
    #[arg(long)]
    limit: Option<usize>,

    /// Give up after this many milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Print each book as a JSON line.
    #[arg(long)]
    json: bool,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = BookClient::connect(ClientConfig {
        target: args.target.clone(),
        request_deadline: args.deadline_ms.map(Duration::from_millis),
        ..Default::default()
    })
    .with_context(|| format!("connecting to {}", args.target))?;

    let filter = BookFilter::new()
        .with_id(args.id)
        .with_name(args.name)
        .with_page_count(args.page_count)
        .with_author_id(args.author_id);

    let mut stream = client.search_books(filter);
    let mut received = 0;
    while let Some(book) = stream.next() {
        let book = book.context("search failed")?;
        if args.json {
            println!("{}", serde_json::to_string(&book)?);
        } else {
            println!("{}", book);
        }

        received += 1;
        if args.limit.map_or(false, |limit| received >= limit) {
            debug!(received, "limit reached, cancelling");
            stream.cancel();
            break;
        }
    }

    client.close();
    Ok(())
}
