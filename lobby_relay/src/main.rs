// CLI entry point for the lobby relay.
//
// Starts a standalone relay server that clients connect to over WebSocket.
// See `server.rs` for the networking architecture and `relay.rs` for the
// lobby state machine.
//
// Usage:
//   relay [OPTIONS]
//     --port <PORT>             Listen port (default: 6969, env PORT)
//     --interval <MS>           Tick period in ms (default: 500, env INTERVAL)
//     --bind <ADDR>             Listen address (default: 0.0.0.0, env BIND)
//     --max-frame-bytes <N>     Largest inbound message (default: 64)
//     --ping-after-ms <MS>      Idle time before a ping (default: 30000)
//     --close-after-ms <MS>     Idle time before closing (default: 40000)
//     --debug-endpoints         Serve /lobbies and /sessions
//     --log-level <LEVEL>       Filter when RUST_LOG is unset (default: info)

use std::net::IpAddr;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use lobby_relay::{LivenessConfig, RelayConfig, start_relay};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Real-time lobby relay: groups clients by instance and tag")]
struct Cli {
    /// Listen port
    #[arg(long, env = "PORT", default_value_t = 6969)]
    port: u16,

    /// Tick period in milliseconds (liveness sweep + snapshot broadcast)
    #[arg(long, env = "INTERVAL", default_value_t = 500,
          value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Listen address
    #[arg(long, env = "BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Largest inbound WebSocket message, in bytes
    #[arg(long, default_value_t = 64)]
    max_frame_bytes: usize,

    /// Idle time before a connection is pinged
    #[arg(long, default_value_t = 30_000)]
    ping_after_ms: u64,

    /// Idle time before a pinged connection is closed
    #[arg(long, default_value_t = 40_000)]
    close_after_ms: u64,

    /// Serve the /lobbies and /sessions debug listings
    #[arg(long)]
    debug_endpoints: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<RelayConfig> {
        ensure!(
            self.close_after_ms >= self.ping_after_ms,
            "--close-after-ms ({}) must not be less than --ping-after-ms ({})",
            self.close_after_ms,
            self.ping_after_ms
        );
        Ok(RelayConfig {
            bind: self.bind,
            port: self.port,
            tick_interval_ms: self.interval,
            max_frame_bytes: self.max_frame_bytes,
            liveness: LivenessConfig {
                ping_after_ms: self.ping_after_ms,
                close_after_ms: self.close_after_ms,
            },
            debug_endpoints: self.debug_endpoints,
        })
    }
}

/// Install the global tracing subscriber: compact output to stderr, filtered
/// by `RUST_LOG` or else `level`.
fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);
    let config = cli.into_config()?;

    let (handle, addr) = start_relay(config)
        .await
        .context("failed to start relay")?;
    info!(%addr, "press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutting down");
    handle.stop().await;
    Ok(())
}
