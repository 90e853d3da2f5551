//! User-visible error responses for the subdomain proxy.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};

/// Minimal HTML page served when a sandbox is paused, with a hint the
/// frontend turns into a resume button.
pub fn paused_page(sandbox_name: &str) -> Response {
    let body = format!(
        "<!doctype html>\n<html>\n<head><title>Sandbox paused</title></head>\n\
         <body>\n<h1>{sandbox_name} is paused</h1>\n\
         <p>This sandbox was paused after being idle. Resume it from the \
         dashboard to continue.</p>\n</body>\n</html>\n"
    );
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Html(body)).into_response();
    response
        .headers_mut()
        .insert("x-resume-hint", HeaderValue::from_static("resume"));
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
    response
}

/// 503 JSON for sandboxes mid-transition (`creating`, `resuming`,
/// `pausing`) or local sandboxes with no tunnel.
pub fn unavailable_json(detail: &str) -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({ "error": detail })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_page_carries_resume_hint() {
        let response = paused_page("dev-box");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("x-resume-hint").unwrap(),
            "resume"
        );
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn unavailable_json_sets_retry_after() {
        let response = unavailable_json("sandbox is resuming");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
