//! Bootstrap seeds: the well-known rendezvous addresses a fresh peer walks
//! to first.
//!
//! Seeds come from `bootstrap.txt` in the state directory when present
//! (one `host port` per line, `#` for comments), from the compiled-in
//! default list otherwise. Hostnames are resolved asynchronously and
//! repeatedly: a single attempt may resolve only some hosts, and partial
//! results are surfaced after every attempt so the overlay can start
//! walking before the last seed's DNS recovers.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while loading the seed list.
///
/// Resolution failures are deliberately absent: a seed that does not
/// resolve is reported through [`ResolveOutcome::success`] and retried,
/// never raised.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The seed file could not be read (a missing file lands here too).
    #[error("cannot read seed file: {0}")]
    Io(#[from] std::io::Error),

    /// The seed file was read but held no usable `host port` line.
    #[error("no usable seed entries in {}", path.display())]
    NoSeeds {
        /// The file that turned out to be empty.
        path: PathBuf,
    },
}

/// The compiled-in seed list, used when no seed file overrides it.
const DEFAULT_SEEDS: &[(&str, u16)] = &[
    ("tracker1.kindred.network", 6421),
    ("tracker2.kindred.network", 6421),
    ("tracker3.kindred.network", 6422),
    ("tracker4.kindred.network", 6423),
];

/// Result of one resolution attempt.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    /// True when every seed resolved. Even when false, `resolved` carries
    /// whatever did resolve this attempt.
    pub success: bool,
    /// All addresses known after this attempt (cumulative).
    pub resolved: Vec<SocketAddr>,
}

/// The seed set and its resolution state.
#[derive(Debug)]
pub struct Bootstrap {
    seeds: Vec<(String, u16)>,
    candidates: HashSet<SocketAddr>,
}

impl Bootstrap {
    pub fn new(seeds: Vec<(String, u16)>) -> Self {
        Self {
            seeds,
            candidates: HashSet::new(),
        }
    }

    /// Loads seeds from `<state_dir>/bootstrap.txt`, falling back to the
    /// compiled-in defaults when the file is absent or holds no valid
    /// entries.
    pub fn from_state_dir(state_dir: &Path) -> Self {
        let path = state_dir.join(crate::config::BOOTSTRAP_FILENAME);
        match Self::load_addresses_from_file(&path) {
            Ok(seeds) => {
                debug!(path = %path.display(), count = seeds.len(), "using seed file");
                Self::new(seeds)
            }
            Err(error) => {
                debug!(path = %path.display(), %error, "using compiled-in default seeds");
                Self::new(Self::default_addresses())
            }
        }
    }

    /// Parses a seed file. Individual malformed lines are logged and
    /// skipped, not fatal; an unreadable file or one without a single
    /// usable entry is an error the caller decides about.
    pub fn load_addresses_from_file(path: &Path) -> Result<Vec<(String, u16)>, BootstrapError> {
        let contents = std::fs::read_to_string(path)?;
        let mut seeds = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next().and_then(|p| p.parse().ok())) {
                (Some(host), Some(port)) => seeds.push((host.to_string(), port)),
                _ => warn!(
                    path = %path.display(),
                    lineno = lineno + 1,
                    "skipping malformed seed line"
                ),
            }
        }
        if seeds.is_empty() {
            return Err(BootstrapError::NoSeeds {
                path: path.to_path_buf(),
            });
        }
        Ok(seeds)
    }

    /// The compiled-in default seed list.
    pub fn default_addresses() -> Vec<(String, u16)> {
        DEFAULT_SEEDS
            .iter()
            .map(|(host, port)| (host.to_string(), *port))
            .collect()
    }

    /// Addresses resolved so far.
    pub fn candidates(&self) -> &HashSet<SocketAddr> {
        &self.candidates
    }

    /// Is `sock_addr` one of our (resolved) seeds?
    pub fn is_bootstrap_candidate(&self, sock_addr: SocketAddr) -> bool {
        self.candidates.contains(&sock_addr)
    }

    /// Resolves every seed once, concurrently. Individual failures are
    /// logged; they never propagate out of the attempt.
    pub async fn resolve(&mut self) -> ResolveOutcome {
        let lookups = self.seeds.iter().map(|(host, port)| {
            let target = format!("{host}:{port}");
            async move {
                match tokio::net::lookup_host(&target).await {
                    Ok(mut addrs) => addrs.next(),
                    Err(error) => {
                        debug!(%target, %error, "seed resolution failed");
                        None
                    }
                }
            }
        });

        let results = join_all(lookups).await;
        let mut success = true;
        for sock_addr in results {
            match sock_addr {
                Some(sock_addr) => {
                    self.candidates.insert(sock_addr);
                }
                None => success = false,
            }
        }

        ResolveOutcome {
            success,
            resolved: self.candidates.iter().copied().collect(),
        }
    }

    /// Resolves on a fixed back-off until every seed is known, invoking
    /// `on_attempt` after each pass. Partial results are included, so
    /// callers can inject what is already available.
    pub async fn resolve_until_success(
        &mut self,
        backoff: Duration,
        mut on_attempt: impl FnMut(&ResolveOutcome),
    ) {
        loop {
            let outcome = self.resolve().await;
            let done = outcome.success;
            on_attempt(&outcome);
            if done {
                debug!(count = self.candidates.len(), "all bootstrap seeds resolved");
                return;
            }
            tokio::time::sleep(backoff).await;
        }
    }
}
