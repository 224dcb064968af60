//! Web API: REST control plane for fixtures, programs and parameters

mod handlers;
mod routes;
mod server;

pub use handlers::ApiResponse;
pub use server::{AppState, WebServer, WebServerConfig};
