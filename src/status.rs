//! Run status marker.
//!
//! External observers (a web front-end polling the working directory, a
//! shell script) learn about a run through two files in `work_dir`:
//!
//! | File | Content | Present |
//! |------|---------|---------|
//! | `processing.txt` | `processing` or `failed` | while running, and after a failure |
//! | `failure_reason.txt` | error message | after a failure |
//!
//! Both files are removed when a run succeeds. Writes go through a temp file
//! and a rename so a reader never sees a half-written marker.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATUS_FILE_NAME: &str = "processing.txt";
pub const FAILURE_REASON_FILE_NAME: &str = "failure_reason.txt";

const PROCESSING: &str = "processing";
const FAILED: &str = "failed";

/// Status as seen from outside the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Processing,
    Failed,
    /// No marker: never started, or finished successfully.
    Absent,
}

/// Handle on the marker files of one working directory.
#[derive(Debug, Clone)]
pub struct StatusMarker {
    marker: PathBuf,
    reason: PathBuf,
}

impl StatusMarker {
    pub fn for_dir(work_dir: &Path) -> Self {
        Self {
            marker: work_dir.join(STATUS_FILE_NAME),
            reason: work_dir.join(FAILURE_REASON_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.marker
    }

    pub fn reason_path(&self) -> &Path {
        &self.reason
    }

    /// Mark the run as in flight, clearing any reason left by an earlier
    /// failed run in the same directory.
    pub async fn begin(&self) -> std::io::Result<()> {
        remove_if_exists(&self.reason).await?;
        write_atomic(&self.marker, PROCESSING).await?;
        debug!("Status marker set: {}", self.marker.display());
        Ok(())
    }

    /// Record a failure. Both files are written; errors are logged only,
    /// the original failure is what the caller reports.
    pub async fn fail(&self, reason: &str) {
        if let Err(e) = write_atomic(&self.marker, FAILED).await {
            warn!("Could not write status marker {}: {}", self.marker.display(), e);
        }
        if let Err(e) = write_atomic(&self.reason, reason).await {
            warn!("Could not write failure reason {}: {}", self.reason.display(), e);
        }
    }

    /// Remove the marker after a successful run.
    pub async fn clear(&self) -> std::io::Result<()> {
        remove_if_exists(&self.marker).await?;
        remove_if_exists(&self.reason).await
    }

    pub async fn read(&self) -> std::io::Result<RunStatus> {
        read_status(&self.marker).await
    }

    /// The persisted failure reason, if any.
    pub async fn failure_reason(&self) -> Option<String> {
        tokio::fs::read_to_string(&self.reason).await.ok()
    }
}

/// Interpret the marker file at `path`.
pub async fn read_status(path: &Path) -> std::io::Result<RunStatus> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(match content.trim() {
            FAILED => RunStatus::Failed,
            _ => RunStatus::Processing,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RunStatus::Absent),
        Err(e) => Err(e),
    }
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
