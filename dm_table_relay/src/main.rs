// CLI entry point for the dm-table relay.
//
// Starts a standalone relay that table clients connect to. The relay binds
// connections to named tables, coordinates a single write leader per table,
// gates state updates on their embedded revision, and fans accepted updates
// out to everyone else at the table. See `server.rs` for the networking
// architecture and `session.rs` for the session rules.
//
// Usage:
//   relay [OPTIONS]
//     --bind <ADDR>        Listen address (default: 0.0.0.0)
//     --port <PORT>        Listen port (default: $PORT or 8080)
//     --ttl-secs <N>       Idle session lifetime (default: 900)
//     --sweep-secs <N>     Eviction sweep period (default: 30)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use dm_table_relay::server::{RelayConfig, start_relay};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args();

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // Wait for Ctrl+C.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc_wait(running_clone);

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("\nShutting down...");
    handle.stop();
}

/// Parse command-line arguments into a `RelayConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency. The `PORT` environment
/// variable seeds the default port so container platforms work untouched;
/// `--port` still wins.
fn parse_args() -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        config.port = port;
    }

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                config.bind = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--bind requires an address");
                    std::process::exit(1);
                });
            }
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--ttl-secs" => {
                i += 1;
                let secs = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--ttl-secs requires a valid number of seconds");
                    std::process::exit(1);
                });
                config.session_ttl = Duration::from_secs(secs);
            }
            "--sweep-secs" => {
                i += 1;
                let secs = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--sweep-secs requires a valid number of seconds");
                    std::process::exit(1);
                });
                config.sweep_interval = Duration::from_secs(secs);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --bind <ADDR>        Listen address (default: 0.0.0.0)");
    println!("  --port <PORT>        Listen port (default: $PORT or 8080)");
    println!("  --ttl-secs <N>       Idle session lifetime in seconds (default: 900)");
    println!("  --sweep-secs <N>     Eviction sweep period in seconds (default: 30)");
    println!("  --help, -h           Show this help");
}

/// Block until Ctrl+C is pressed, then set the flag to false.
fn ctrlc_wait(running: Arc<AtomicBool>) {
    // The process exits on SIGINT/SIGTERM by default, which tears down the
    // listener and every reader thread — acceptable for a relay that keeps
    // no state worth flushing. If a graceful drain is ever needed, wire in
    // the `ctrlc` crate here and flip the flag from its handler.
    let _ = running;
}
