//! # CLI Interface
//!
//! Command-line argument structure for `kindred-tracker` using `clap`
//! derive. The tracker is a single long-running process, so there are no
//! subcommands, just the handful of flags deployment scripts expect.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use kindred_protocol::config::DEFAULT_TRACKER_PORT;
use kindred_protocol::identity::CryptoPolicy;

/// Kindred standalone rendezvous tracker.
///
/// Accepts introduction traffic for arbitrary overlays, synthesizes
/// overlay state on demand, and reflects walkers onto each other. Prints
/// line-oriented telemetry on stdout unless silenced.
#[derive(Parser, Debug)]
#[command(name = "kindred-tracker", about = "Kindred rendezvous tracker", version)]
pub struct TrackerCli {
    /// State directory: holds the destroy-evidence log and the optional
    /// bootstrap seed file.
    #[arg(long, default_value = ".", env = "KINDRED_STATEDIR")]
    pub statedir: PathBuf,

    /// Address the UDP endpoint binds to.
    #[arg(long, default_value = "0.0.0.0", env = "KINDRED_IP")]
    pub ip: IpAddr,

    /// UDP port the tracker listens on.
    #[arg(long, default_value_t = DEFAULT_TRACKER_PORT, env = "KINDRED_PORT")]
    pub port: u16,

    /// Suppress all stdout telemetry.
    #[arg(long)]
    pub silent: bool,

    /// Signature policy: NoVerifyCrypto signs but never verifies (the
    /// default), NoCrypto treats keys as bare identifiers.
    #[arg(long, default_value = "NoVerifyCrypto", value_parser = parse_crypto)]
    pub crypto: CryptoPolicy,

    /// Identifier attached to every log line; useful when aggregating logs
    /// from several trackers.
    #[arg(long, default_value = "tracker")]
    pub log_identifier: String,
}

/// Parses the crypto policy names accepted on the command line.
fn parse_crypto(name: &str) -> Result<CryptoPolicy, String> {
    CryptoPolicy::from_cli_name(name)
        .ok_or_else(|| format!("unknown crypto type: {name} (expected NoCrypto or NoVerifyCrypto)"))
}
