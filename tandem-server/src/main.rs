//! Tandem server binary.
//!
//! Serves the room sync protocol over WebSocket until the process exits.

use std::time::Duration;

use clap::Parser;
use log::info;
use tandem_sync::server::{ServerConfig, SyncServer};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Real-time collaborative text room server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TANDEM_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Frames queued per connection before new ones are dropped
    #[arg(long, env = "TANDEM_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Reject edits larger than this many bytes
    #[arg(long, env = "TANDEM_MAX_TEXT_BYTES", value_name = "BYTES")]
    max_text_bytes: Option<usize>,

    /// Evict rooms that have had no members for this many seconds
    #[arg(long, env = "TANDEM_ROOM_TTL_SECS", value_name = "SECS")]
    room_ttl_secs: Option<u64>,

    /// Seconds between idle room sweeps
    #[arg(long, env = "TANDEM_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,
}

fn config_from_args(args: &Args) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        outbound_capacity: args.outbound_capacity,
        max_text_bytes: args.max_text_bytes,
        room_ttl: args.room_ttl_secs.map(Duration::from_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        ..ServerConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = config_from_args(&args);
    info!("Starting tandem-server on {}", config.bind_addr);

    SyncServer::new(config).run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_config() {
        let args = Args::try_parse_from([
            "tandem-server",
            "--host",
            "127.0.0.1",
            "-p",
            "6001",
            "--room-ttl-secs",
            "90",
            "--max-text-bytes",
            "1024",
        ])
        .unwrap();
        let config = config_from_args(&args);

        assert_eq!(config.bind_addr, "127.0.0.1:6001");
        assert_eq!(config.room_ttl, Some(Duration::from_secs(90)));
        assert_eq!(config.max_text_bytes, Some(1024));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_room_ttl_is_optional() {
        let args = Args::try_parse_from(["tandem-server", "--room-ttl-secs", "5"]).unwrap();
        assert_eq!(config_from_args(&args).room_ttl, Some(Duration::from_secs(5)));

        let args = Args::try_parse_from(["tandem-server", "--sweep-interval-secs", "1"]).unwrap();
        assert_eq!(config_from_args(&args).sweep_interval, Duration::from_secs(1));
    }
}
