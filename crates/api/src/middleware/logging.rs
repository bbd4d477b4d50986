use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::Instant;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Get the default tracing layer for HTTP requests
pub fn get_tracing_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

/// Request logging with a generated `x-request-id`
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value);
    }

    let span = info_span!("http_request", request_id = %request_id, method = %method, uri = %uri);
    let response = next.run(request).instrument(span).await;

    let duration_ms = start_time.elapsed().as_millis() as u64;
    let status = response.status();
    if status.is_server_error() {
        error!(request_id = %request_id, status = %status, duration_ms, "HTTP request failed with server error");
    } else if status.is_client_error() {
        warn!(request_id = %request_id, status = %status, duration_ms, "HTTP request failed with client error");
    } else {
        info!(request_id = %request_id, status = %status, duration_ms, "HTTP request completed");
    }

    response
}
