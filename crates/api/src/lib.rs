//! # Analytics Pipeline API Server
//!
//! REST and WebSocket surface over the agent pipeline orchestrator.
//!
//! ## Usage Patterns
//!
//! 1. **POST** `/runs` with `{file_id, query}` - start a run, returns `run_id`
//! 2. Connect to **WebSocket** `/runs/{run_id}/stream` for live events;
//!    reconnect with `?from=<last sequence>` to replay what was missed
//! 3. **GET** `/runs/{run_id}` to poll status and per-task progress
//! 4. **GET** `/runs/{run_id}/results` once the run has completed
//!
//! Runs are controlled with `POST /runs/{run_id}/pause|resume|cancel|retry`
//! and dropped with `DELETE /runs/{run_id}` once terminal.
//!
//! ## Error Handling
//!
//! Failures return an [`ErrorResponse`] with a machine-readable `code`:
//! `VALIDATION_ERROR`, `RUN_NOT_FOUND`, `INVALID_STATE`, `RESULTS_NOT_READY`,
//! `UPGRADE_REQUIRED` (stream requests that are not WebSocket upgrades) or
//! `INTERNAL_ERROR`.

pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;

pub use server::{router, ApiServer, AppState};
pub use types::*;
