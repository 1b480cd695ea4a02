//! Stream session manager.
//!
//! [`SessionManager`] is a cheap, clonable handle. Every operation is sent as
//! a message to a single actor task that owns the registry, the table of
//! creations in flight and the counters, so no two operations ever interleave
//! their mutations. Slow work (directory creation, spawning, readiness
//! polling, teardown) runs in spawned tasks that report back by message.

mod actor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hls_relay_config::Config;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::cleaner::CleanupPolicy;
use crate::encode::EncoderCommand;
use crate::readiness::ReadinessPolicy;
use crate::session::{ActiveStream, SessionError, SessionId, StreamTicket};
use crate::source::SourceLocator;

use actor::{Command, ManagerActor};

/// Capacity of the command queue between handles and the actor
const COMMAND_QUEUE_DEPTH: usize = 100;

/// Everything the manager needs to know about where and how to run sessions.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Parent of every session output directory
    pub output_root: PathBuf,
    pub manifest_name: String,
    /// Base URL under which `output_root` is served
    pub public_base_url: String,
    pub readiness: ReadinessPolicy,
    pub cleanup: CleanupPolicy,
    /// Graceful stop window before the encoder is killed
    pub stop_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let stop_timeout = Duration::from_secs(config.encoder.stop_timeout_secs);
        Self {
            output_root: config.output.root.clone(),
            manifest_name: config.output.manifest_name.clone(),
            public_base_url: config.server.public_base_url.clone(),
            readiness: ReadinessPolicy::from_config(&config.readiness),
            cleanup: CleanupPolicy::new(
                Duration::from_millis(config.cleanup.grace_ms),
                stop_timeout,
            ),
            stop_timeout,
        }
    }
}

/// Lifetime counters, reported by `/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    /// Sessions currently registered
    pub active_sessions: usize,
    /// Creations currently in flight
    pub pending_creations: usize,
    /// Sessions that reached `Ready`
    pub sessions_started: u64,
    /// Connects served by an existing or in-flight session
    pub coalesced_joins: u64,
    pub creation_failures: u64,
    /// Encoders that exited without being asked to
    pub abnormal_exits: u64,
    /// Sessions handed to the cleaner
    pub teardowns: u64,
}

/// Outcome of a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// No live session has this id
    Unknown,
    /// Reference dropped; this many remain
    Remaining(u32),
    /// Last reference dropped; the session is being torn down
    Drained,
}

/// Handle to the session manager actor.
#[derive(Debug, Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Spawn the manager actor on the current runtime.
    ///
    /// # Arguments
    /// * `settings` - Output layout and timing
    /// * `encoder` - Builds the encoder process for each new session
    pub fn start(settings: ManagerSettings, encoder: Arc<dyn EncoderCommand>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = ManagerActor::new(settings, encoder);
        tokio::spawn(actor.run(rx));
        Self { commands: tx }
    }

    /// Join or create the session for `source`.
    ///
    /// Every successful call holds one reference until a matching
    /// [`disconnect`](Self::disconnect) or an explicit [`stop`](Self::stop).
    ///
    /// # Errors
    /// * `UnsupportedSource` - scheme is not RTSP/RTMP; nothing was started
    /// * `SpawnFailure`, `ReadinessTimeout`, `ExitedBeforeReady` - creation
    ///   failed; every caller that joined the same attempt gets the same error
    /// * `ShuttingDown` - the manager is stopping or stopped
    pub async fn connect(&self, source: &str) -> Result<StreamTicket, SessionError> {
        let locator = SourceLocator::parse(source)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { locator, reply })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        rx.await.unwrap_or(Err(SessionError::ShuttingDown))
    }

    /// Drop one reference to session `id`. Unknown ids are a no-op.
    pub async fn disconnect(&self, id: SessionId) -> Released {
        self.request(|reply| Command::Disconnect { id, reply })
            .await
            .unwrap_or(Released::Unknown)
    }

    /// Tear session `id` down regardless of its reference count.
    ///
    /// # Returns
    /// `true` if a live session was found
    pub async fn stop(&self, id: SessionId) -> bool {
        self.request(|reply| Command::Stop { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Snapshot of registered sessions, oldest first.
    pub async fn list_active(&self) -> Vec<ActiveStream> {
        self.request(|reply| Command::List { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> ManagerStats {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    /// Stop everything and wait until every encoder has exited and every
    /// output directory is gone. Later calls return immediately.
    pub async fn shutdown_all(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.ok()?;
        rx.await.ok()
    }
}
