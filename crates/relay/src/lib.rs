//! HLS Relay
//!
//! Turns live RTSP/RTMP sources into HLS playlists on demand. One encoder
//! runs per source no matter how many viewers ask for it; the session
//! manager coalesces concurrent requests, counts viewers and tears the
//! encoder and its output down when the last one leaves or the encoder dies.

pub mod cleaner;
pub mod encode;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod readiness;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;
pub mod source;
pub mod startup;
pub mod supervisor;
pub mod ws;

pub use cleaner::{
    cleanup_session, remove_output_dir, sweep_stale_outputs, CleanupError, CleanupPolicy,
};
pub use encode::{build_ffmpeg_command, EncoderCommand, FfmpegCommand, HlsPolicy};
pub use hls_relay_config as config;
pub use hls_relay_config::Config;
pub use manager::{ManagerSettings, ManagerStats, Released, SessionManager};
pub use metrics::{collect_host_metrics, HostMetrics, StatsResponse};
pub use readiness::{wait_for_manifest, ReadinessError, ReadinessPolicy};
pub use registry::{RegistryError, SessionRegistry};
pub use server::{create_router, AppState};
pub use service::{shutdown_signal, RelayService, ServiceError};
pub use session::{ActiveStream, SessionError, SessionId, SessionState, StreamTicket};
pub use source::{SourceKey, SourceLocator, SourceScheme};
pub use startup::{
    check_encoder_available, parse_ffmpeg_version, run_startup_checks, StartupError,
};
pub use supervisor::{EncoderHandle, ProcessEvent, ProcessExit, StopSignal};
