//! hermes: text-framed request/response server
//!
//! Serves PING and INFO out of the box, and COPY file transfer when started
//! with `--service copy`. Configuration comes from CLI arguments or a TOML
//! file. A line on stdin stops the server.

use hermes::config::{Config, ServiceKind};
use hermes::runtime::{DefaultHandler, Handler, Manager};
use hermes::services::CopyService;
use std::io::BufRead;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let settings = config.settings()?;

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        service = ?config.service,
        max_header_size = config.max_header_size,
        "Starting hermes server"
    );

    let handler: Arc<dyn Handler> = match config.service {
        ServiceKind::Default => Arc::new(DefaultHandler),
        ServiceKind::Copy => {
            info!(root = %config.copy_root.display(), "Copy service enabled");
            Arc::new(CopyService::new(config.copy_root.clone()))
        }
    };

    let manager = Manager::start(settings, handler)?;

    wait_for_stop();

    info!("Stopping hermes server");
    manager.shutdown(true);
    Ok(())
}

/// Block until a line arrives on stdin. Without a usable stdin the server
/// runs until killed.
fn wait_for_stop() {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(n) if n > 0 => {}
        _ => loop {
            std::thread::park();
        },
    }
}
