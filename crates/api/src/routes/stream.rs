use analytics_common::RunId;
use analytics_pipeline::EventStream;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use super::parse_run_id;
use crate::server::AppState;
use crate::types::{error_response, ApiResult, ErrorResponse, StreamQuery};

/// WebSocket handler streaming a run's events.
///
/// `?from=N` replays retained events with a sequence above `N` before live
/// delivery. The socket is closed after the run's terminal event. The run is
/// looked up before the upgrade, so unknown runs answer 404.
#[instrument(skip(ws, state, query))]
pub async fn websocket_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let run_id = parse_run_id(&run_id)?;
    let events = state
        .orchestrator
        .subscribe(run_id, query.from)
        .map_err(error_response)?;
    let ws = ws.map_err(|rejection| {
        warn!(run_id = %run_id, error = %rejection.body_text(), "Rejected WebSocket upgrade");
        (
            rejection.status(),
            Json(ErrorResponse::new(rejection.body_text(), "UPGRADE_REQUIRED")),
        )
    })?;

    info!(run_id = %run_id, from = ?query.from, "WebSocket connection upgrade requested");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, run_id, events)))
}

async fn handle_socket(socket: WebSocket, run_id: RunId, mut events: EventStream) {
    let (mut sender, mut receiver) = socket.split();
    let mut delivered = 0usize;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(run_id = %run_id, error = %e, "Failed to serialize event");
                        break;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    warn!(run_id = %run_id, error = %e, "Failed to send WebSocket message");
                    return;
                }
                delivered += 1;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    info!(run_id = %run_id, delivered, "Client closed WebSocket connection");
                    return;
                }
                Some(Ok(other)) => debug!(run_id = %run_id, ?other, "Ignoring inbound message"),
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!(run_id = %run_id, delivered, "Event stream finished");
}
