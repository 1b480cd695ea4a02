//! Session data model.
//!
//! A [`StreamSession`] is one transcoding job shared by every consumer of a
//! source. Consumers only ever see the [`StreamTicket`] (id + public URL).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::source::{SourceKey, SourceLocator};
use crate::supervisor::{EncoderHandle, ProcessExit};

/// Errors surfaced to `connect` callers.
///
/// Cloneable because one creation failure is delivered to every caller that
/// joined the same attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Scheme is not one the encoder is set up to ingest
    #[error("Unsupported stream URL protocol: {0}")]
    UnsupportedSource(String),

    /// Output directory or encoder process could not be created
    #[error("Failed to start encoder: {0}")]
    SpawnFailure(String),

    /// Encoder ran but never produced a playlist
    #[error("Timeout waiting for playlist after {}s", .0.as_secs())]
    ReadinessTimeout(Duration),

    /// Encoder died before its first playlist was written
    #[error("Encoder exited before the stream was ready ({0})")]
    ExitedBeforeReady(ProcessExit),

    /// The manager is stopping and accepts no new work
    #[error("Stream manager is shutting down")]
    ShuttingDown,
}

/// Opaque session identifier, also used as the output directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Encoder spawned, playlist not yet seen
    Pending,
    /// Playlist exists; consumers may attach
    Ready,
    /// Being stopped on purpose
    Draining,
    /// Process gone and output scheduled for removal
    Terminated,
    /// Creation failed or the encoder died on its own
    Failed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Failed)
                | (Ready, Draining)
                | (Ready, Failed)
                | (Draining, Terminated)
                | (Failed, Terminated)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Ready => "ready",
            SessionState::Draining => "draining",
            SessionState::Terminated => "terminated",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a consumer receives from a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTicket {
    #[serde(rename = "streamId")]
    pub id: SessionId,
    #[serde(rename = "streamUrl")]
    pub public_url: String,
}

/// Filesystem locations owned by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    /// `<root>/<id>`, never shared between sessions
    pub dir: PathBuf,
    /// Playlist whose appearance marks the session ready
    pub manifest: PathBuf,
}

impl OutputPaths {
    pub fn for_session(root: &Path, id: SessionId, manifest_name: &str) -> Self {
        let dir = root.join(id.to_string());
        let manifest = dir.join(manifest_name);
        Self { dir, manifest }
    }
}

/// Build the externally reachable playlist URL for a session.
pub fn public_url(base: &str, id: SessionId, manifest_name: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), id, manifest_name)
}

/// One shared transcoding job.
#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub source: SourceLocator,
    pub output: OutputPaths,
    pub public_url: String,
    /// Exclusively owned; dropping it kills the encoder
    pub handle: EncoderHandle,
    pub reference_count: u32,
    pub state: SessionState,
    /// Unix milliseconds, diagnostics only
    pub created_at: i64,
}

impl StreamSession {
    pub fn key(&self) -> &SourceKey {
        self.source.key()
    }

    pub fn ticket(&self) -> StreamTicket {
        StreamTicket {
            id: self.id,
            public_url: self.public_url.clone(),
        }
    }

    /// Move to `next`, returning false (and staying put) if the move is illegal.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> ActiveStream {
        ActiveStream {
            id: self.id,
            source: self.key().clone(),
            public_url: self.public_url.clone(),
            reference_count: self.reference_count,
            state: self.state,
            created_at_unix_ms: self.created_at,
        }
    }
}

/// Read-only view of a live session for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStream {
    #[serde(rename = "streamId")]
    pub id: SessionId,
    pub source: SourceKey,
    #[serde(rename = "streamUrl")]
    pub public_url: String,
    #[serde(rename = "referenceCount")]
    pub reference_count: u32,
    pub state: SessionState,
    #[serde(rename = "createdAt")]
    pub created_at_unix_ms: i64,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 5] = [
        SessionState::Pending,
        SessionState::Ready,
        SessionState::Draining,
        SessionState::Terminated,
        SessionState::Failed,
    ];

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        let allowed = [
            (Pending, Ready),
            (Pending, Failed),
            (Ready, Draining),
            (Ready, Failed),
            (Draining, Terminated),
            (Failed, Terminated),
        ];
        for from in ALL_STATES {
            for to in ALL_STATES {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminated_is_a_sink() {
        for to in ALL_STATES {
            assert!(!SessionState::Terminated.can_transition_to(to));
        }
    }

    #[test]
    fn test_output_paths_are_namespaced_by_id() {
        let root = Path::new("/srv/hls");
        let a = SessionId::new();
        let b = SessionId::new();
        let pa = OutputPaths::for_session(root, a, "index.m3u8");
        let pb = OutputPaths::for_session(root, b, "index.m3u8");

        assert_ne!(pa.dir, pb.dir);
        assert_eq!(pa.dir, root.join(a.to_string()));
        assert_eq!(pa.manifest, pa.dir.join("index.m3u8"));
    }

    #[test]
    fn test_public_url_handles_trailing_slash() {
        let id: SessionId = "4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b".parse().unwrap();
        assert_eq!(
            public_url("https://cdn.example.com/hls/", id, "index.m3u8"),
            "https://cdn.example.com/hls/4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b/index.m3u8"
        );
    }

    #[test]
    fn test_ticket_serializes_with_stream_fields() {
        let id: SessionId = "4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b".parse().unwrap();
        let ticket = StreamTicket {
            id,
            public_url: "http://h/hls/x/index.m3u8".to_string(),
        };
        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["streamId"], "4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b");
        assert_eq!(json["streamUrl"], "http://h/hls/x/index.m3u8");
    }

    #[test]
    fn test_session_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
