//! Accept TCP connections and drain them into bounded per-connection buffers.
//!
//! At most `--requests` connections are buffered at once. Additional connections wait in the
//! listen backlog (`--backlog`) until a buffered connection closes or goes idle. For each
//! drained connection, the number of bytes received is logged.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin slotdrain -- --port 8080 --requests 200 --idle-timeout 5000
//! ```
//!
//! Send some bytes:
//!
//! ```sh
//! head -c 2000 /dev/urandom | nc -q 0 127.0.0.1 8080
//! ```

use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use slotdrain_server::{
    signal::Signaler,
    tokio::{Config as NetworkConfig, Network},
    default_max_concurrent_requests, Config, Network as _, Reporter, Server,
};
use std::{
    net::{IpAddr, SocketAddr},
    process::ExitCode,
    str::FromStr,
    time::Duration,
};
use tokio::runtime::Builder;
use tracing::{error, info, Level};

fn main() -> ExitCode {
    let defaults = Config::default();

    // Parse arguments
    let matches = Command::new("slotdrain")
        .about("drain TCP connections into bounded per-connection buffers")
        .arg(
            Arg::new("address")
                .long("address")
                .default_value("0.0.0.0")
                .value_parser(value_parser!(IpAddr))
                .help("IP address to listen on"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .default_value("8080")
                .value_parser(value_parser!(u16))
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("backlog")
                .long("backlog")
                .default_value("500")
                .value_parser(value_parser!(u32))
                .help("Connections queued by the operating system before they are accepted"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(usize))
                .help("Worker threads (defaults to the available parallelism)"),
        )
        .arg(
            Arg::new("requests")
                .long("requests")
                .value_parser(value_parser!(usize))
                .help("Connections buffered at once (defaults to 100 per worker)"),
        )
        .arg(
            Arg::new("initial-buffer")
                .long("initial-buffer")
                .default_value("1024")
                .value_parser(value_parser!(usize))
                .help("Initial size of each connection's buffer in bytes"),
        )
        .arg(
            Arg::new("max-buffer")
                .long("max-buffer")
                .default_value("16777216")
                .value_parser(value_parser!(usize))
                .help("Size in bytes after which a connection is dropped"),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .default_value("30000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds a connection may stay silent before its slot is released"),
        )
        .arg(
            Arg::new("nodelay")
                .long("nodelay")
                .action(ArgAction::SetTrue)
                .help("Disable Nagle's algorithm on accepted connections"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Maximum level of emitted logs (trace, debug, info, warn, error)"),
        )
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .map(|level| Level::from_str(level))
        .transpose();
    let level = match level {
        Ok(level) => level.unwrap_or(Level::INFO),
        Err(err) => {
            eprintln!("invalid log level: {err}");
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure server
    let ip = *matches.get_one::<IpAddr>("address").expect("default provided");
    let port = *matches.get_one::<u16>("port").expect("default provided");
    let worker_threads = matches
        .get_one::<usize>("workers")
        .copied()
        .unwrap_or(defaults.worker_threads);
    let max_concurrent_requests = matches
        .get_one::<usize>("requests")
        .copied()
        .unwrap_or_else(|| default_max_concurrent_requests(worker_threads));
    let cfg = Config {
        address: SocketAddr::new(ip, port),
        backlog: *matches.get_one::<u32>("backlog").expect("default provided"),
        worker_threads,
        max_concurrent_requests,
        initial_buffer_size: *matches
            .get_one::<usize>("initial-buffer")
            .expect("default provided"),
        max_buffer_size: *matches
            .get_one::<usize>("max-buffer")
            .expect("default provided"),
        idle_timeout: Duration::from_millis(
            *matches
                .get_one::<u64>("idle-timeout")
                .expect("default provided"),
        ),
    };
    if let Err(err) = cfg.validate() {
        error!(?err, "invalid configuration");
        return ExitCode::FAILURE;
    }
    let nodelay = matches.get_flag("nodelay").then_some(true);
    info!(?cfg, ?nodelay, "loaded configuration");

    // Start runtime
    let runtime = Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads)
        .enable_all()
        .build()
        .expect("failed to create Tokio runtime");
    let result = runtime.block_on(async move {
        let network = Network::from(NetworkConfig::default().with_tcp_nodelay(nodelay));
        let listener = network.bind(cfg.address, cfg.backlog).await?;
        let mut registry = Registry::default();
        let server = Server::new(cfg, listener, Reporter, &mut registry)?;
        info!(address = ?server.local_addr(), "listening");

        // Stop on ctrl-c
        let (signaler, signal) = Signaler::new();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                // Keep the signaler alive so the server is not stopped
                error!(?err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("received ctrl-c");
            signaler.signal(0);
        });
        let result = server.run(signal).await;

        // Report totals before exiting
        let mut encoded = String::new();
        if encode(&mut encoded, &registry).is_ok() {
            info!("final metrics:\n{encoded}");
        }
        result
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}
