//! Correlation-id middleware (§4.11): generates an `x-correlation-id` if the
//! caller didn't send one, stores it on request extensions for handlers and
//! `tracing::error!` to pick up, and echoes it back on the response.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

const HEADER_NAME: &str = "x-correlation-id";

#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

pub async fn correlation_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER_NAME, value);
    }
    response
}
