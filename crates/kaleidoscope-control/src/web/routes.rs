//! REST API route definitions

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;
use super::server::AppState;

/// Build the API router.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/fixtures", get(handlers::get_fixtures))
        .route("/api/v1/fixtures/:fixture", get(handlers::get_fixture))
        .route(
            "/api/v1/fixtures/:fixture/programs",
            get(handlers::get_programs),
        )
        .route(
            "/api/v1/fixtures/:fixture/programs/:program",
            get(handlers::get_program),
        )
        .route(
            "/api/v1/fixtures/:fixture/set_active_program",
            post(handlers::set_active_program),
        )
        .route(
            "/api/v1/fixtures/:fixture/cycle_active_program",
            post(handlers::cycle_active_program),
        )
        .route(
            "/api/v1/fixtures/:fixture/programs/:program/parameters",
            get(handlers::get_parameters),
        )
        .route(
            "/api/v1/fixtures/:fixture/programs/:program/parameters/:parameter",
            get(handlers::get_parameter).post(handlers::set_parameter),
        )
        .route(
            "/api/v1/fixtures/:fixture/programs/:program/parameters/:parameter/cycle",
            post(handlers::cycle_parameter),
        )
        .route("/api/v1/events", post(handlers::post_events))
}
