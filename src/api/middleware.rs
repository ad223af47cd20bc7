use axum::{
    body::{self, Body},
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::{AppError, Result};
use crate::idempotency::{Classification, ReplayRequest, ReplayResponse};
use crate::observability::{get_metrics, LatencyTimer};

use super::routes::AppState;

/// Routes mutating requests through the replay engine.
///
/// Requests the protocol does not apply to are forwarded without buffering.
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.engine.classify(request.method(), request.headers()) == Classification::NotApplicable {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let body = match body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AppError::PayloadTooLarge(format!(
                "Request body could not be buffered within {} bytes: {}",
                state.max_body_bytes, e
            ))
            .into_response();
        }
    };

    let replay_request = ReplayRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        headers: parts.headers.clone(),
        body,
    };

    let result = state
        .engine
        .handle(replay_request, move |request: ReplayRequest| async move {
            let response = next
                .run(Request::from_parts(parts, Body::from(request.body)))
                .await;
            buffer_response(response).await
        })
        .await;

    match result {
        Ok(outcome) => into_http_response(outcome.into_response()),
        Err(e) => e.into_response(),
    }
}

/// Records request count and latency for every route.
pub async fn track_http_metrics(request: Request, next: Next) -> Response {
    let timer = LatencyTimer::new();
    let method = request.method().to_string();
    let path = route_label(&request);

    let response = next.run(request).await;

    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());
    response
}

/// Route template the request matched, so path parameters and unknown paths
/// do not each become their own metric series.
fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
}

async fn buffer_response(response: Response) -> Result<ReplayResponse> {
    let (parts, body) = response.into_parts();
    let body = body::to_bytes(body, usize::MAX).await.map_err(|e| {
        AppError::Internal(anyhow::anyhow!("Failed to buffer downstream response: {}", e))
    })?;

    Ok(ReplayResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

fn into_http_response(replayed: ReplayResponse) -> Response {
    let mut response = Response::new(Body::from(replayed.body));
    *response.status_mut() = replayed.status;
    *response.headers_mut() = replayed.headers;
    response
}
