//! tagstream - live and offline driver for the game stream parser
//!
//! `connect` attaches to a Lich proxy and prints the main output as plain
//! text; `replay` feeds a captured stream through the same pipeline.

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagstream::config::Config;
use tagstream::core::{EventBus, Pipeline};
use tagstream::data::TagNode;
use tagstream::network::{LichConnection, ServerMessage, Utf8Decoder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(ClapParser)]
#[command(name = "tagstream")]
#[command(about = "Incremental parser and stream router for the GemStone IV game protocol", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host to connect to (default: 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Port number to connect to (default: 8000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Character name for loading character-specific settings
    #[arg(long)]
    character: Option<String>,

    /// Custom data directory (default: ~/.tagstream)
    /// Can also be set via TAGSTREAM_DIR environment variable
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Also show stream regions (thoughts, speech, ...) in the main output
    #[arg(long)]
    mirror: bool,

    /// Print events published under this name to stderr (repeatable),
    /// e.g. `--watch prompt --watch progressBar:health`
    #[arg(long, value_name = "EVENT")]
    watch: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a Lich proxy; stdin lines are sent as game commands
    Connect,

    /// Feed a captured stream through the pipeline in fixed-size chunks
    Replay {
        /// Capture file (raw stream bytes)
        file: PathBuf,

        /// Bytes per chunk
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,

        /// Print main output tags as JSON, one per line
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging to file (use RUST_LOG env var to control level, e.g. RUST_LOG=debug)
    // stdout carries the game text, so logs go to a file
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("tagstream.log")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false) // No color codes in log file
        .init();

    let cli = Cli::parse();

    // Set custom data directory if specified (via CLI or environment variable)
    if let Some(data_dir) = &cli.data_dir {
        std::env::set_var("TAGSTREAM_DIR", data_dir);
        tracing::info!("Using custom data directory: {:?}", data_dir);
    } else if let Ok(env_dir) = std::env::var("TAGSTREAM_DIR") {
        tracing::info!("Using data directory from TAGSTREAM_DIR: {}", env_dir);
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load(cli.character.as_deref())?,
    };
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if cli.mirror {
        config.router.mirror = true;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match &cli.command {
            Commands::Connect => run_connect(config, &cli.watch).await,
            Commands::Replay {
                file,
                chunk_size,
                json,
            } => run_replay(config, &cli.watch, file, *chunk_size, *json).await,
        }
    })
}

/// Build the pipeline and hook `--watch` events up to stderr
fn build_pipeline(config: &Config, watch: &[String]) -> Pipeline {
    let bus = Arc::new(EventBus::new());
    for event in watch {
        let name = event.clone();
        bus.subscribe(event, move |tag: &TagNode| {
            let mut attrs: Vec<String> = tag
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={:?}", k, v))
                .collect();
            attrs.sort();
            eprintln!("[{}] {} {}", name, attrs.join(" "), tag.plain_text().trim_end());
            Ok(())
        });
    }
    Pipeline::new(config, bus)
}

fn print_tags(tags: &[TagNode], json: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for tag in tags {
        if json {
            let line = serde_json::to_string(tag).context("Failed to serialize tag")?;
            writeln!(out, "{}", line)?;
        } else {
            write!(out, "{}", tag.plain_text())?;
        }
    }
    out.flush()?;
    Ok(())
}

async fn run_connect(config: Config, watch: &[String]) -> Result<()> {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();

    let pipeline = build_pipeline(&config, watch);

    let host = config.connection.host.clone();
    let port = config.connection.port;
    let network_handle = tokio::spawn(async move {
        if let Err(e) = LichConnection::start(&host, port, server_tx, command_rx).await {
            tracing::error!(error = ?e, "Network connection error");
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            message = server_rx.recv() => match message {
                Some(ServerMessage::Chunk(chunk)) => {
                    let tags = pipeline.process_chunk(chunk).await?;
                    print_tags(&tags, false)?;
                }
                Some(ServerMessage::Connected) => {
                    eprintln!("Connected to {}:{}", config.connection.host, config.connection.port);
                }
                Some(ServerMessage::Disconnected) | None => {
                    let tags = pipeline.finish().await?;
                    print_tags(&tags, false)?;
                    eprintln!("Disconnected");
                    break;
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if command_tx.send(line).is_err() {
                        tracing::warn!("Connection is gone, dropping command");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    drop(command_tx);
    let _ = network_handle.await;
    Ok(())
}

async fn run_replay(
    config: Config,
    watch: &[String],
    file: &Path,
    chunk_size: usize,
    json: bool,
) -> Result<()> {
    let bytes = std::fs::read(file).context(format!("Failed to read capture file: {:?}", file))?;
    let pipeline = build_pipeline(&config, watch);
    let mut decoder = Utf8Decoder::new();

    let mut chunks = 0;
    for piece in bytes.chunks(chunk_size.max(1)) {
        let chunk = decoder.decode(piece);
        if chunk.is_empty() {
            continue;
        }
        let tags = pipeline.process_chunk(chunk).await?;
        print_tags(&tags, json)?;
        chunks += 1;
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        print_tags(&pipeline.process_chunk(tail).await?, json)?;
    }
    print_tags(&pipeline.finish().await?, json)?;

    tracing::info!("Replayed {} chunk(s) from {:?}", chunks, file);
    eprintln!();
    eprintln!("--- {} chunk(s) of up to {} bytes ---", chunks, chunk_size);
    let buffers = pipeline.buffers();
    for channel in buffers.channels() {
        eprintln!(
            "{:>16}: {} message(s), {} unread",
            channel,
            buffers.len(&channel),
            buffers.unread_count(&channel)
        );
    }
    Ok(())
}
