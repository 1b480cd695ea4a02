//! Relay service startup and main loop
//!
//! Wires configuration, startup checks, the session manager and the HTTP
//! server together, and shuts them down in order: sessions first, then the
//! listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use hls_relay_config::{Config, ConfigError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::encode::FfmpegCommand;
use crate::manager::{ManagerSettings, SessionManager};
use crate::server::{create_router, AppState};
use crate::startup::{prepare_output_root, run_startup_checks, StartupError};

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Listener could not be bound or the server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Service state containing all runtime components
pub struct RelayService {
    /// Configuration loaded from file and environment
    pub config: Config,
    manager: SessionManager,
    shutdown: CancellationToken,
}

impl RelayService {
    /// Initialize the service
    ///
    /// This performs the full startup sequence:
    /// 1. Check the encoder binary and its codecs
    /// 2. Create the output root and sweep stale session directories
    /// 3. Start the session manager
    ///
    /// # Returns
    /// * `Ok(RelayService)` - Service initialized successfully
    /// * `Err(ServiceError)` - Initialization failed
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        run_startup_checks(&config.encoder.program)?;
        Self::new_without_checks(config).await
    }

    /// Initialize the service without probing the encoder
    ///
    /// Useful for testing or when the encoder is a wrapper script that does
    /// not answer `-version`.
    pub async fn new_without_checks(config: Config) -> Result<Self, ServiceError> {
        config.validate()?;
        prepare_output_root(&config.output.root).await?;

        let encoder = Arc::new(FfmpegCommand::from_config(&config.encoder));
        let manager = SessionManager::start(ManagerSettings::from_config(&config), encoder);

        Ok(Self {
            config,
            manager,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a clone of the manager handle
    pub fn manager(&self) -> SessionManager {
        self.manager.clone()
    }

    /// Token that stops the service when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the HTTP router for this service
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            groups: Arc::new(self.config.groups.clone()),
            shutdown: self.shutdown.clone(),
        };
        create_router(state, &self.config.output.root)
    }

    /// Bind the configured address and serve until the shutdown token fires
    ///
    /// On shutdown every session is drained before the listener stops.
    pub async fn run(self) -> Result<(), ServiceError> {
        let listener = TcpListener::bind(&self.config.server.bind).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServiceError> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(
            %addr,
            public_base_url = %self.config.server.public_base_url,
            output_root = %self.config.output.root.display(),
            "relay listening"
        );

        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("shutdown requested, draining sessions");
                manager.shutdown_all().await;
            })
            .await;

        // Covers the server stopping on its own
        self.manager.shutdown_all().await;
        if let Err(e) = &result {
            warn!(error = %e, "server stopped with error");
        }
        result.map_err(ServiceError::from)
    }
}

/// Resolve once Ctrl-C or, on unix, SIGTERM arrives
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        config.output.root = root.join("hls_streams");
        config
    }

    #[tokio::test]
    async fn test_service_initialization_without_checks() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let stale = config.output.root.join("old-session");
        std::fs::create_dir_all(&stale).unwrap();

        let service = RelayService::new_without_checks(config.clone()).await.unwrap();

        assert_eq!(service.config, config);
        assert!(config.output.root.is_dir());
        assert!(!stale.exists());
        assert!(service.manager().list_active().await.is_empty());
        service.manager().shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.output.manifest_name = String::new();

        let result = RelayService::new_without_checks(config).await;
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_token() {
        let tmp = TempDir::new().unwrap();
        let service = RelayService::new_without_checks(test_config(tmp.path()))
            .await
            .unwrap();
        let token = service.shutdown_token();
        let manager = service.manager();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(service.serve(listener));

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), server)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
        // Manager is gone with the service
        assert_eq!(
            manager.connect("rtsp://cam1/stream").await,
            Err(crate::session::SessionError::ShuttingDown)
        );
    }
}
