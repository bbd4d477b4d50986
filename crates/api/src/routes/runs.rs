//! Run lifecycle endpoints

use analytics_common::{LogEntry, RunResults, RunSummary, RunView};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, instrument, warn};

use super::{parse_agent, parse_run_id, stream_url};
use crate::server::AppState;
use crate::types::{error_response, ApiResult, ControlResponse, ErrorResponse, StartRunRequest, StartRunResponse};

/// Start a run and return immediately.
///
/// Progress is streamed on the returned `stream_url`; the run's state can
/// also be polled with `GET /runs/{run_id}`.
#[instrument(skip(state, body))]
pub async fn start_run(
    State(state): State<AppState>,
    body: Result<Json<StartRunRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let Json(request) = body.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Rejected start request body");
        (
            rejection.status(),
            Json(ErrorResponse::new(rejection.body_text(), "VALIDATION_ERROR")),
        )
    })?;

    let run_id = state
        .orchestrator
        .start_run(&request.file_id, &request.query)
        .await
        .map_err(error_response)?;
    let view = state.orchestrator.get_run_status(run_id).await.map_err(error_response)?;
    info!(run_id = %run_id, file_id = %request.file_id, "Run accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            stream_url: stream_url(run_id),
            status: view.run.status,
            retry_of: None,
        }),
    ))
}

pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    Json(state.orchestrator.list_runs().await)
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunView>> {
    let run_id = parse_run_id(&run_id)?;
    let view = state.orchestrator.get_run_status(run_id).await.map_err(error_response)?;
    Ok(Json(view))
}

#[instrument(skip(state))]
pub async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.pause_run(run_id).await.map_err(error_response)?;
    control_response(&state, run_id).await
}

#[instrument(skip(state))]
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.resume_run(run_id).await.map_err(error_response)?;
    control_response(&state, run_id).await
}

#[instrument(skip(state))]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.cancel_run(run_id).await.map_err(error_response)?;
    control_response(&state, run_id).await
}

#[instrument(skip(state))]
pub async fn retry_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let previous = parse_run_id(&run_id)?;
    let run_id = state.orchestrator.retry_run(previous).await.map_err(error_response)?;
    let view = state.orchestrator.get_run_status(run_id).await.map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            stream_url: stream_url(run_id),
            status: view.run.status,
            retry_of: Some(previous),
        }),
    ))
}

#[instrument(skip(state))]
pub async fn purge_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.purge_run(run_id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Final outputs; `409 RESULTS_NOT_READY` until the run has completed
pub async fn get_results(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResults>> {
    let run_id = parse_run_id(&run_id)?;
    let results = state.orchestrator.get_run_results(run_id).await.map_err(error_response)?;
    Ok(Json(results))
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path((run_id, agent)): Path<(String, String)>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let run_id = parse_run_id(&run_id)?;
    let agent = parse_agent(&agent)?;
    let logs = state
        .orchestrator
        .get_task_logs(run_id, agent)
        .await
        .map_err(error_response)?;
    Ok(Json(logs))
}

async fn control_response(state: &AppState, run_id: analytics_common::RunId) -> ApiResult<Json<ControlResponse>> {
    let view = state.orchestrator.get_run_status(run_id).await.map_err(error_response)?;
    Ok(Json(ControlResponse {
        run_id,
        status: view.run.status,
    }))
}
