//! The destroy-evidence log.
//!
//! Tracker overlays live purely in memory, so proof that an overlay was
//! destroyed must survive restarts on its own. Every destroy transition
//! appends a block of records to `persistent-storage.data` in the state
//! directory:
//!
//! ```text
//! # received dispersy-destroy-community from 203.0.113.7:6421
//! dispersy-destroy-community 0101ab...
//! dispersy-identity 0101cd...
//! dispersy-authorize 0101ef...
//! ```
//!
//! On startup the file is replayed in reverse line order through the
//! normal incoming-packet path (caching disabled, loopback sender), which
//! reconstructs each destroyed overlay in its killed state without any
//! network traffic. A corrupt line is logged and skipped; it never aborts
//! startup.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::PERSISTENT_STORAGE_FILENAME;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of the tracker's persistent side.
///
/// Corrupt *lines* are not represented here: a bad line is skipped with a
/// warning during [`EvidenceLog::load`]. What does surface is a file-level
/// failure the caller has to decide about, write failures during a destroy
/// transition included.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The evidence file could not be read or written.
    #[error("evidence log io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Append-only evidence file in the tracker's state directory.
#[derive(Debug, Clone)]
pub struct EvidenceLog {
    path: PathBuf,
}

impl EvidenceLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PERSISTENT_STORAGE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one destroy transition: a header naming the sender, then
    /// each evidence record as `<name> <hex-packet>`.
    ///
    /// The file is opened in append mode per write; this process is the
    /// only writer.
    pub fn append(
        &self,
        received_from: &str,
        records: &[(&'static str, Bytes)],
    ) -> TrackerResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(
            file,
            "# received dispersy-destroy-community from {received_from}"
        )?;
        for (name, packet) in records {
            writeln!(file, "{} {}", name, hex::encode(packet))?;
        }
        Ok(())
    }

    /// Loads every packet in file order. Comment lines are skipped; a line
    /// that does not parse is logged and skipped. A missing file is an
    /// empty history, not an error; any other read failure is.
    pub fn load(&self) -> TrackerResult<Vec<Vec<u8>>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no destroy evidence to load");
                return Ok(Vec::new());
            }
            Err(error) => return Err(TrackerError::Io(error)),
        };

        let mut packets = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((_name, packet_hex)) = line.split_once(' ') else {
                warn!(lineno = lineno + 1, "malformed evidence line, skipping");
                continue;
            };
            match hex::decode(packet_hex.trim()) {
                Ok(packet) => packets.push(packet),
                Err(error) => {
                    warn!(lineno = lineno + 1, %error, "undecodable evidence packet, skipping");
                }
            }
        }
        Ok(packets)
    }
}
