// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Kindred Rendezvous Tracker
//!
//! Entry point for the `kindred-tracker` binary. Parses CLI arguments,
//! initializes logging, binds the UDP endpoint, replays the destroy
//! evidence, and drives the tracker engine from a single event loop.
//!
//! Telemetry contract (stdout, suppressed by `--silent`):
//!
//! - every 300 s: `BANDWIDTH up down`, `COMMUNITY trackers killed
//!   discoveries`, `CANDIDATE2 total`, `OUTGOING name count`
//! - per event: `REQ_IN2`, `RES_IN2`, `DESTROY_IN`, `DESTROY_OUT`
//!
//! Exit status is 0 after a clean SIGINT/SIGTERM shutdown and 1 when
//! startup fails (unbindable port, unwritable state directory).

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::Instrument;

use kindred_protocol::community::Outgoing;
use kindred_protocol::config::{
    BOOTSTRAP_RETRY_INTERVAL, COMMUNITY_CLEANUP_INTERVAL, PING_INTERVAL, STATISTICS_INTERVAL,
};
use kindred_protocol::discovery::{Bootstrap, ResolveOutcome};
use kindred_protocol::tracker::TrackerEngine;

use cli::TrackerCli;
use logging::LogFormat;

/// Maximum UDP datagram we accept. Overlay packets are far smaller, but a
/// short buffer would silently truncate and corrupt decoding.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Cadence of the request-cache expiry sweep.
const TIMEOUT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let cli = TrackerCli::parse();

    logging::init_logging(
        "kindred_tracker=info,kindred_protocol=info",
        LogFormat::Pretty,
    );
    let span = tracing::info_span!("tracker", identifier = %cli.log_identifier);

    if let Err(error) = run(cli).instrument(span).await {
        tracing::error!("startup failed: {error:#}");
        std::process::exit(1);
    }
}

/// Full tracker lifecycle.
///
/// Startup sequence:
/// 1. Prepare the state directory
/// 2. Bind the UDP endpoint
/// 3. Create the engine (fresh process-wide member)
/// 4. Replay the destroy-evidence log
/// 5. Spawn bootstrap seed resolution
/// 6. Drive the event loop until SIGINT/SIGTERM
async fn run(cli: TrackerCli) -> Result<()> {
    // --- 1. State directory ---
    prepare_state_dir(&cli.statedir)?;

    // --- 2. UDP endpoint ---
    let bind_addr = SocketAddr::new(cli.ip, cli.port);
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind UDP endpoint on {bind_addr}"))?;
    tracing::info!(%bind_addr, silent = cli.silent, crypto = ?cli.crypto, "tracker listening");

    // --- 3. Engine ---
    let mut engine = TrackerEngine::new(&cli.statedir, cli.silent, cli.crypto);

    // --- 4. Evidence replay ---
    engine.start(Instant::now());

    // --- 5. Bootstrap resolution ---
    // Seeds resolve on their own task; results flow back into the event
    // loop so all engine state stays single-owner.
    let (seed_tx, mut seed_rx) = mpsc::unbounded_channel::<ResolveOutcome>();
    let statedir = cli.statedir.clone();
    tokio::spawn(async move {
        let mut bootstrap = Bootstrap::from_state_dir(&statedir);
        bootstrap
            .resolve_until_success(BOOTSTRAP_RETRY_INTERVAL, |outcome| {
                let _ = seed_tx.send(outcome.clone());
            })
            .await;
    });

    // --- 6. Event loop ---
    let start = tokio::time::Instant::now();
    let mut cleanup_tick =
        tokio::time::interval_at(start + COMMUNITY_CLEANUP_INTERVAL, COMMUNITY_CLEANUP_INTERVAL);
    let mut statistics_tick =
        tokio::time::interval_at(start + STATISTICS_INTERVAL, STATISTICS_INTERVAL);
    let mut ping_tick = tokio::time::interval_at(start + PING_INTERVAL, PING_INTERVAL);
    let mut timeout_tick =
        tokio::time::interval_at(start + TIMEOUT_POLL_INTERVAL, TIMEOUT_POLL_INTERVAL);

    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                match received {
                    Ok((length, from)) => {
                        let outgoing = engine.handle_packet(&buffer[..length], from, Instant::now());
                        transmit(&socket, &outgoing).await;
                    }
                    Err(error) => {
                        // Transient socket errors (e.g. ICMP-induced) are
                        // not fatal for a UDP service.
                        tracing::debug!(%error, "recv_from failed");
                    }
                }
            }
            _ = cleanup_tick.tick() => {
                engine.unload_inactive_communities(Instant::now());
            }
            _ = statistics_tick.tick(), if !cli.silent => {
                engine.report_statistics(Instant::now());
            }
            _ = ping_tick.tick() => {
                let outgoing = engine.create_ping_requests(Instant::now());
                transmit(&socket, &outgoing).await;
            }
            _ = timeout_tick.tick() => {
                let outgoing = engine.poll_timeouts(Instant::now());
                transmit(&socket, &outgoing).await;
            }
            Some(outcome) = seed_rx.recv() => {
                tracing::info!(
                    resolved = outcome.resolved.len(),
                    complete = outcome.success,
                    "bootstrap seeds resolved"
                );
                engine
                    .discovery_mut()
                    .add_bootstrap_candidates(&outcome.resolved, Instant::now());
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("kindred-tracker stopped");
    Ok(())
}

/// Creates the state directory when missing.
fn prepare_state_dir(path: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create state directory {}", path.display()))
}

/// Puts a batch of outgoing packets on the wire. Send failures are logged
/// and swallowed: UDP owes nobody anything.
async fn transmit(socket: &UdpSocket, outgoing: &[Outgoing]) {
    for action in outgoing {
        for target in &action.targets {
            if let Err(error) = socket.send_to(&action.packet, target).await {
                tracing::debug!(%target, %error, kind = ?action.kind, "send failed");
            }
        }
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
