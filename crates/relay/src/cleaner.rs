//! Lifecycle cleaner.
//!
//! Tears a session down once the manager has taken it out of the registry:
//! ask the encoder to stop, wait for it to go, give readers a grace period,
//! then delete the output directory. Removal failures are logged and
//! swallowed; nothing here is reported back to consumers.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::session::{SessionState, StreamSession};
use crate::supervisor::StopSignal;

/// Output directory removal failure.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Failed to remove output directory {path}: {source}")]
    RemoveDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read output root {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Timing for a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Delay between process exit and directory removal
    pub grace: Duration,
    /// Upper bound on waiting for the process to exit
    pub exit_wait: Duration,
}

impl CleanupPolicy {
    /// Exit wait is the encoder's stop timeout plus one second, so a
    /// graceful stop that escalates to a kill is still observed.
    pub fn new(grace: Duration, stop_timeout: Duration) -> Self {
        Self {
            grace,
            exit_wait: stop_timeout.saturating_add(Duration::from_secs(1)),
        }
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_secs(5))
    }
}

/// Stop the encoder and remove the session's output.
///
/// The caller must already have moved the session to `Draining` or `Failed`
/// and removed it from the registry. The handle is dropped at the end, which
/// kills the process if it somehow outlived the exit wait.
pub async fn cleanup_session(mut session: StreamSession, policy: CleanupPolicy) {
    session.handle.stop(StopSignal::Graceful);

    match tokio::time::timeout(policy.exit_wait, session.handle.wait_exit()).await {
        Ok(exit) => debug!(session = %session.id, exit = %exit, "encoder stopped"),
        Err(_) => {
            warn!(
                session = %session.id,
                pid = ?session.handle.pid(),
                wait_secs = policy.exit_wait.as_secs_f32(),
                "encoder still running after stop, forcing kill"
            );
            session.handle.stop(StopSignal::Force);
        }
    }

    if !session.transition(SessionState::Terminated) {
        warn!(session = %session.id, state = %session.state, "unexpected state at teardown");
    }

    tokio::time::sleep(policy.grace).await;

    if let Err(e) = remove_output_dir(&session.output.dir).await {
        error!(session = %session.id, error = %e, "cleanup failure");
    }
    info!(session = %session.id, source = %session.key(), "session terminated");
}

/// Recursively delete `dir`. A directory that is already gone counts as removed.
pub async fn remove_output_dir(dir: &Path) -> Result<(), CleanupError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CleanupError::RemoveDir {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Remove every subdirectory of `root` left behind by a previous run.
///
/// Plain files at the top level are left alone. Returns the number of
/// directories removed; individual removal failures are logged and skipped.
pub async fn sweep_stale_outputs(root: &Path) -> Result<usize, CleanupError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(CleanupError::ReadRoot {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(source) => {
                return Err(CleanupError::ReadRoot {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        match remove_output_dir(&entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(error = %e, "could not remove stale output"),
        }
    }

    if removed > 0 {
        info!(root = %root.display(), removed, "swept stale session outputs");
    }
    Ok(removed)
}
