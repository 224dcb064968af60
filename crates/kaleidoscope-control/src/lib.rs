//! Kaleidoscope Control - External Surfaces
//!
//! The pieces that connect the tick engine to the outside world:
//! - **Web API**: REST control plane for fixtures, programs and parameters
//! - **Actuator sink**: pushes each tick's output vector to Submarine
//! - **Metrics**: Prometheus exporter on its own listener

#![allow(missing_docs)]

use thiserror::Error;

pub mod metrics;
pub mod sink;
pub mod web;

pub use sink::run_sink;
pub use web::{WebServer, WebServerConfig};

/// Control surface errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Web API or HTTP server error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Actuator sink error
    #[error("sink error: {0}")]
    SinkError(String),

    /// Standard IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;
