//! Axum HTTP server

use std::net::SocketAddr;

use axum::http::{header, Method};
use crossbeam_channel::Sender;
use tower_http::cors::{Any, CorsLayer};

use kaleidoscope_core::Event;
use kaleidoscope_host::ControlCommand;

use crate::{ControlError, Result};

use super::routes::build_router;

/// Application state shared across all requests.
#[derive(Clone)]
pub struct AppState {
    /// Mutations and metadata reads, applied at tick boundaries.
    pub commands: Sender<ControlCommand>,
    /// Input events, drained at the next tick boundary.
    pub events: Sender<Event>,
}

/// Web server configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebServerConfig {
    pub listen_address: String,
    pub enable_cors: bool,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            // Bind to localhost to prevent accidental network exposure.
            listen_address: "127.0.0.1:8383".to_string(),
            enable_cors: true,
        }
    }
}

impl WebServerConfig {
    /// Create a config for the given listen address.
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            ..Default::default()
        }
    }

    /// Set CORS enabled/disabled.
    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }
}

/// Web server for the REST control plane.
pub struct WebServer {
    config: WebServerConfig,
    state: AppState,
}

impl WebServer {
    /// Create a new web server over the scheduler's command/event queues.
    pub fn new(
        config: WebServerConfig,
        commands: Sender<ControlCommand>,
        events: Sender<Event>,
    ) -> Self {
        Self {
            config,
            state: AppState { commands, events },
        }
    }

    /// Run the web server (blocking).
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_address
            .parse()
            .map_err(|e| ControlError::HttpError(format!("invalid listen address: {}", e)))?;

        let app = build_router().with_state(self.state);

        let app = if self.config.enable_cors {
            app.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers([header::CONTENT_TYPE])
                    .allow_origin(Any),
            )
        } else {
            app
        };

        tracing::info!("control plane listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::HttpError(format!("failed to bind: {}", e)))?;
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|e| ControlError::HttpError(format!("server error: {}", e)))?;

        Ok(())
    }

    /// Spawn the server in a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_server_config() {
        let config = WebServerConfig::new("0.0.0.0:9000").with_cors(false);
        assert_eq!(config.listen_address, "0.0.0.0:9000");
        assert!(!config.enable_cors);
    }

    #[test]
    fn test_default_binds_localhost() {
        let config = WebServerConfig::default();
        assert!(config.listen_address.starts_with("127.0.0.1"));
    }
}
