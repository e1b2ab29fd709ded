//! NetSentry Node
//! ==============
//! Host shim for the content-inspection core: command-line glue, logging
//! and metrics setup, and the event loop draining deferred scan
//! completions. The core itself is not command-line-addressable.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::json;

use netsentry::core::{Core, CoreConfig};
use netsentry::metrics::{init_metrics, update_system_metrics};
use netsentry::runtime::EventLoop;

#[derive(Debug, Parser)]
#[command(name = "netsentry-node", version)]
struct Args {
    /// Enable the HTTP disk cache in the host service.
    #[arg(long)]
    enable_http_disk_cache: bool,

    /// Stop at startup until a debugger attaches.
    #[arg(long)]
    wait_for_debugger: bool,

    /// Client certificate presented by the host service.
    #[arg(long)]
    certificate: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing with JSON format for structured logging
    tracing_subscriber::fmt()
        .event_format(json())
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if args.wait_for_debugger {
        info!(pid = std::process::id(), "waiting for debugger");
        // SAFETY: raising SIGSTOP on our own process is always valid.
        unsafe { libc::raise(libc::SIGSTOP) };
    }

    init_metrics();
    info!("Prometheus metrics initialized");

    info!("Starting NetSentry node v{}", env!("CARGO_PKG_VERSION"));
    if args.enable_http_disk_cache {
        info!("HTTP disk cache requested by host service");
    }
    if let Some(certificate) = &args.certificate {
        info!(certificate = %certificate.display(), "client certificate configured");
    }

    let config = CoreConfig::discover()
        .ok_or("no user-data directory available on this platform")?;
    let (mut event_loop, remote) = EventLoop::new();
    let mut core = Core::new(config, remote)?;

    info!("content-inspection core ready");
    info!(
        workers = core.scanner().worker_count(),
        "scan worker pool online"
    );

    let mut metrics_interval = tokio::time::interval(std::time::Duration::from_secs(30));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(task) = event_loop.next() => task(),
            _ = metrics_interval.tick() => update_system_metrics(),
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "signal handler failed, shutting down anyway");
                }
                break;
            }
        }
    }

    info!("shutting down");
    core.shutdown();
    event_loop.run_until_idle();
    Ok(())
}
