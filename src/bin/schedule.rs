//! The schedule service daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::info;

use wayline::config::Config;
use wayline::core::NodeVersion;
use wayline::service::ScheduleService;
use wayline::transport::Bus;

#[derive(Parser, Debug)]
#[command(name = "wayline-schedule", about = "Run the wayline schedule service")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the participant registry log location.
    #[arg(long)]
    log_file_location: Option<PathBuf>,

    /// Node version announced in heartbeats; a standby taking over should
    /// pass a higher value than the node it replaces.
    #[arg(long, default_value_t = 0)]
    node_version: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(path) = args.log_file_location {
        config.log_file_location = path;
    }
    wayline::telemetry::init(&config.logging);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let bus = Bus::new();
    let service = ScheduleService::spawn(bus, config, NodeVersion::new(args.node_version))?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("shutdown signal received");
    service.shutdown();
    Ok(())
}
