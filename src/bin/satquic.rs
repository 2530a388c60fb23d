//! satquic - QUIC proxy for high-latency satellite links.
//!
//! Terminates QUIC datagrams at the link endpoint and offloads per-packet
//! transforms to an accelerator when one is attached. Without a device the
//! simulated accelerator stands in, so the full dispatch path is always
//! exercised.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use satquic::config::ProxyConfig;
use satquic::crypto::FixedSaltKeyProvider;
use satquic::offload::{OffloadDispatcher, SimulatedAccelerator};
use satquic::proxy::{Proxy, ProxyError};

/// QUIC proxy for satellite links.
#[derive(Parser, Debug)]
#[command(name = "satquic", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4433")]
    listen: SocketAddr,

    /// Run every transform in software; do not attach an accelerator.
    #[arg(long)]
    disable_accel: bool,

    /// Do not echo received stream data back to the sender.
    #[arg(long)]
    no_echo: bool,

    /// Per-request offload deadline, in seconds.
    #[arg(long, default_value_t = 5)]
    offload_deadline: u64,

    /// Reap connections idle for longer than this many seconds.
    #[arg(long, default_value_t = 30)]
    idle_timeout: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("satquic={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = ProxyConfig {
        listen: args.listen,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        offload_deadline: Duration::from_secs(args.offload_deadline),
        accelerate: !args.disable_accel,
        echo: !args.no_echo,
        ..ProxyConfig::default()
    };

    let dispatcher = if args.disable_accel {
        OffloadDispatcher::software_only()
    } else {
        OffloadDispatcher::new(
            Some(Arc::new(SimulatedAccelerator::default())),
            config.offload_deadline,
        )
    };

    let proxy = Proxy::bind(config, Arc::new(FixedSaltKeyProvider), Arc::new(dispatcher)).await?;
    proxy.run().await
}
