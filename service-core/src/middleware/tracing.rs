use axum::http::HeaderValue;
use axum::{extract::Request, middleware::Next, response::Response};
use ::tracing::Span;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Propagate `x-request-id` from the caller, or mint one, on both the
/// request and the response.
///
/// Layer this outside `TraceLayer` so [`make_request_span`] sees the id.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// The one `http_request` span per request, for `TraceLayer::make_span_with`.
///
/// Caller fields start empty and are recorded by extractors once the
/// caller is known.
pub fn make_request_span(req: &Request) -> Span {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-");

    ::tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %req.method(),
        uri = %req.uri(),
        version = ?req.version(),
        org_id = ::tracing::field::Empty,
        user_id = ::tracing::field::Empty,
        role = ::tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn request_span_is_named_after_http_requests() {
        let req = Request::builder()
            .uri("/health")
            .header(REQUEST_ID_HEADER, "req-1")
            .body(Body::empty())
            .unwrap();

        let span = make_request_span(&req);
        let metadata = span.metadata().unwrap();
        assert_eq!(metadata.name(), "http_request");
        for field in ["request_id", "org_id", "user_id", "role"] {
            assert!(metadata.fields().field(field).is_some(), "missing {field}");
        }
    }
}
