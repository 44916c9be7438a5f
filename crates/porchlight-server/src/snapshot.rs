//! Cooldown snapshot persistence.
//!
//! The snapshot is diagnostic only: it records whether a cooldown is running
//! and when that state began, so an operator can see what the broker was
//! doing before a restart. It is never used to restore state.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;

/// Timestamp format used in snapshots.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The persisted cooldown state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownSnapshot {
    /// Whether a cooldown is active.
    pub in_cooldown: bool,
    /// Local time of the transition that produced this snapshot.
    pub started_at: String,
}

impl CooldownSnapshot {
    /// Create a snapshot for a transition at the given time.
    #[must_use]
    pub fn new(in_cooldown: bool, at: DateTime<Local>) -> Self {
        Self {
            in_cooldown,
            started_at: at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Sink for cooldown snapshots.
///
/// `record` must not block the caller; persistence failures are the
/// writer's problem, never the caller's.
pub trait SnapshotWriter: Send + Sync {
    /// Queue a snapshot for persistence.
    fn record(&self, snapshot: CooldownSnapshot);
}

/// Writes snapshots to a JSON file from a background task.
///
/// Snapshots are written in the order they were recorded. Each write goes to
/// a temporary file which is then renamed over the target, so readers never
/// see a partial document.
#[derive(Debug, Clone)]
pub struct FileSnapshotWriter {
    tx: mpsc::UnboundedSender<CooldownSnapshot>,
}

impl FileSnapshotWriter {
    /// Spawn the writer task for `path`.
    ///
    /// The task exits once every `FileSnapshotWriter` clone is dropped and
    /// the queue has drained.
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CooldownSnapshot>();

        let handle = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                match write_snapshot(&path, &snapshot).await {
                    Ok(()) => debug!(
                        path = %path.display(),
                        in_cooldown = snapshot.in_cooldown,
                        "Cooldown snapshot written"
                    ),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to write cooldown snapshot");
                        metrics::record_error("snapshot");
                    }
                }
            }
        });

        (Self { tx }, handle)
    }
}

impl SnapshotWriter for FileSnapshotWriter {
    fn record(&self, snapshot: CooldownSnapshot) {
        if self.tx.send(snapshot).is_err() {
            warn!("Cooldown snapshot writer has stopped; snapshot dropped");
        }
    }
}

async fn write_snapshot(path: &Path, snapshot: &CooldownSnapshot) -> Result<()> {
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");

    tokio::fs::write(&tmp, &body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

    Ok(())
}

/// Read the snapshot left by a previous run, if any.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn read_snapshot(path: &Path) -> Result<Option<CooldownSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let snapshot = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
