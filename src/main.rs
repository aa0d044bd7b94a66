//! webtransport-echo: runs the echo endpoint against a loopback peer
//!
//! The peer exercises every echo path:
//! - Bidirectional echo, delivered in chunks under a small send window
//! - Unidirectional echoes, queued behind limited stream credit
//! - Datagram acknowledgment
//!
//! Configuration via CLI arguments or TOML file.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use webtransport_echo::config::Config;
use webtransport_echo::runtime::run_loopback;

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

    info!(
        bidirectional = ?config.bidirectional,
        greeting_stream = config.greeting_stream,
        unidirectional_streams = config.unidirectional_streams,
        stream_window = config.stream_window,
        unidirectional_credit = config.unidirectional_credit,
        "Starting webtransport-echo loopback"
    );

    let report = run_loopback(&config).map_err(|e| {
        error!(error = %e, "Loopback verification failed");
        e
    })?;

    info!(
        bidirectional_bytes = report.bidirectional_bytes,
        unidirectional_echoes = report.unidirectional_echoes,
        datagram_acks = report.datagram_acks,
        peak_pending_echoes = report.peak_pending_echoes,
        events = report.events,
        "All echoes verified"
    );
    Ok(())
}
