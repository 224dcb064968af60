//! HTTP request handlers
//!
//! Mutations and metadata reads round-trip through the scheduler's command
//! queue, so every response reflects state at a tick boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;

use kaleidoscope_core::{Event, ParameterSetRequest};
use kaleidoscope_host::{
    CommandError, ControlCommand, EngineSnapshot, FixtureSnapshot, ProgramSnapshot, Reply,
};

use super::server::AppState;

/// How long a handler waits for the scheduler to reach a tick boundary.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn command_error(err: CommandError) -> ApiError {
    let status = match &err {
        CommandError::NotFound(_) => StatusCode::NOT_FOUND,
        CommandError::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

fn unavailable() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiResponse::error("scheduler unavailable".to_string())),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("not found: {}", what))),
    )
}

/// Queue one command and wait for its boundary reply.
async fn dispatch<T>(
    state: &AppState,
    make: impl FnOnce(Reply<T>) -> ControlCommand,
) -> Result<T, ApiError> {
    let (tx, rx) = oneshot::channel();
    state.commands.send(make(tx)).map_err(|_| unavailable())?;
    match timeout(COMMAND_TIMEOUT, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(command_error(err)),
        Ok(Err(_)) | Err(_) => Err(unavailable()),
    }
}

async fn snapshot(state: &AppState) -> Result<EngineSnapshot, ApiError> {
    dispatch(state, |reply| ControlCommand::Snapshot { reply }).await
}

/// GET /api/v1/fixtures - list fixtures
pub async fn get_fixtures(State(state): State<AppState>) -> ApiResult<EngineSnapshot> {
    let snapshot = snapshot(&state).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// GET /api/v1/fixtures/:fixture - fixture metadata
pub async fn get_fixture(
    Path(fixture): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<FixtureSnapshot> {
    let snapshot = snapshot(&state).await?;
    let fixture = snapshot
        .fixtures
        .get(&fixture)
        .cloned()
        .ok_or_else(|| not_found(&fixture))?;
    Ok(Json(ApiResponse::success(fixture)))
}

/// GET /api/v1/fixtures/:fixture/programs - program catalog
pub async fn get_programs(
    Path(fixture): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<BTreeMap<String, ProgramSnapshot>> {
    let snapshot = snapshot(&state).await?;
    let fixture = snapshot
        .fixtures
        .get(&fixture)
        .ok_or_else(|| not_found(&fixture))?;
    Ok(Json(ApiResponse::success(fixture.programs.clone())))
}

/// GET /api/v1/fixtures/:fixture/programs/:program - program metadata
pub async fn get_program(
    Path((fixture, program)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<ProgramSnapshot> {
    let snapshot = snapshot(&state).await?;
    let program = snapshot
        .fixtures
        .get(&fixture)
        .and_then(|f| f.programs.get(&program))
        .cloned()
        .ok_or_else(|| not_found(&program))?;
    Ok(Json(ApiResponse::success(program)))
}

/// POST /api/v1/fixtures/:fixture/set_active_program - body: program name
pub async fn set_active_program(
    Path(fixture): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> ApiResult<()> {
    let program = body.trim().to_string();
    if program.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("empty program name".to_string())),
        ));
    }
    dispatch(&state, |reply| ControlCommand::SetActiveProgram {
        fixture,
        program,
        reply,
    })
    .await?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /api/v1/fixtures/:fixture/cycle_active_program
pub async fn cycle_active_program(
    Path(fixture): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<String> {
    let next = dispatch(&state, |reply| ControlCommand::CycleActiveProgram {
        fixture,
        reply,
    })
    .await?;
    Ok(Json(ApiResponse::success(next)))
}

/// GET /api/v1/fixtures/:fixture/programs/:program/parameters
pub async fn get_parameters(
    Path((fixture, program)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<BTreeMap<String, kaleidoscope_core::Parameter>> {
    let snapshot = snapshot(&state).await?;
    let program = snapshot
        .fixtures
        .get(&fixture)
        .and_then(|f| f.programs.get(&program))
        .ok_or_else(|| not_found(&program))?;
    Ok(Json(ApiResponse::success(program.parameters.clone())))
}

/// GET /api/v1/fixtures/:fixture/programs/:program/parameters/:parameter
pub async fn get_parameter(
    Path((fixture, program, parameter)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> ApiResult<kaleidoscope_core::Parameter> {
    let snapshot = snapshot(&state).await?;
    let parameter = snapshot
        .fixtures
        .get(&fixture)
        .and_then(|f| f.programs.get(&program))
        .and_then(|p| p.parameters.get(&parameter))
        .cloned()
        .ok_or_else(|| not_found(&parameter))?;
    Ok(Json(ApiResponse::success(parameter)))
}

/// POST /api/v1/fixtures/:fixture/programs/:program/parameters/:parameter
pub async fn set_parameter(
    Path((fixture, program, parameter)): Path<(String, String, String)>,
    State(state): State<AppState>,
    Json(request): Json<ParameterSetRequest>,
) -> ApiResult<()> {
    dispatch(&state, |reply| ControlCommand::SetParameter {
        fixture,
        program,
        parameter,
        request,
        reply,
    })
    .await?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /api/v1/fixtures/:fixture/programs/:program/parameters/:parameter/cycle
pub async fn cycle_parameter(
    Path((fixture, program, parameter)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> ApiResult<String> {
    let label = dispatch(&state, |reply| ControlCommand::CycleParameter {
        fixture,
        program,
        parameter,
        reply,
    })
    .await?;
    Ok(Json(ApiResponse::success(label)))
}

/// POST /api/v1/events - inject input events
pub async fn post_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<Event>>,
) -> ApiResult<usize> {
    let count = events.len();
    for event in events {
        if state.events.send(event).is_err() {
            return Err(unavailable());
        }
    }
    Ok(Json(ApiResponse::success(count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success(42);
        assert!(response.success);
        assert_eq!(response.data, Some(42));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_api_response_error() {
        let response: ApiResponse<()> = ApiResponse::error("boom".to_string());
        assert!(!response.success);
        assert!(response.data.is_none());
        assert_eq!(response.error, Some("boom".to_string()));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = command_error(CommandError::NotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = command_error(CommandError::Invalid("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let response = ApiResponse::success(5);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"data\""));
        assert!(!json.contains("\"error\""));
    }
}
