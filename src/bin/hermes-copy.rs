//! hermes-copy: send a local file to a hermes copy service.
//!
//! ```text
//! hermes-copy <src> <host> <port> <dst> <chunk_size>
//! ```

use clap::Parser;
use hermes::protocol::{Codec, Integrity};
use hermes::runtime::Connector;
use hermes::services::copy_file;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the copy client
#[derive(Parser, Debug)]
#[command(name = "hermes-copy")]
#[command(version = "0.1.0")]
#[command(about = "Copy a file to a hermes server", long_about = None)]
struct CliArgs {
    /// Local file to send
    src: PathBuf,

    /// Server host
    host: String,

    /// Server port
    port: u16,

    /// Destination path below the server's copy root
    dst: String,

    /// Bytes per COPY message
    chunk_size: usize,

    /// Attach MD5 body checksums (defaults to the build setting)
    #[arg(long, overrides_with = "no_checksums")]
    checksums: bool,

    /// Send bodies without checksums
    #[arg(long, overrides_with = "checksums")]
    no_checksums: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let integrity = if cli.checksums {
        Integrity::Md5
    } else if cli.no_checksums {
        Integrity::Disabled
    } else {
        Integrity::default()
    };
    let codec = Codec::default().with_integrity(integrity);

    let started = Instant::now();
    let mut connector = Connector::connect_with(&cli.host, cli.port, codec)?;
    let sent = copy_file(&mut connector, &cli.src, &cli.dst, cli.chunk_size)?;
    connector.close();

    info!(
        src = %cli.src.display(),
        dst = %cli.dst,
        bytes = sent,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Copy finished"
    );
    Ok(())
}
