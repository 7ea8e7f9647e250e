//! Response middleware chain
//!
//! The TLS-side router is wrapped, outermost first, in:
//!
//! 1. request tracing
//! 2. gzip compression, when the client accepts it
//! 3. `Strict-Transport-Security` on every response
//! 4. host normalization to the canonical `www.` form
//!
//! and only then reaches the routing table.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::predicate::{And, NotForContentType, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::backend::request_host;

/// Two years, subdomains included, eligible for preload lists
pub const HSTS_VALUE: &str = "max-age=63072000; includeSubDomains; preload";

/// Responses smaller than this are not worth compressing
pub const GZIP_MIN_SIZE: u16 = 1400;

type GzipPredicate = And<And<SizeAbove, NotForContentType>, NotForContentType>;

/// Append `Strict-Transport-Security` to every response
pub fn hsts_layer() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::appending(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static(HSTS_VALUE),
    )
}

/// Gzip responses for clients that advertise support
pub fn compression_layer() -> CompressionLayer<GzipPredicate> {
    let predicate = SizeAbove::new(GZIP_MIN_SIZE)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::SSE);
    CompressionLayer::new().compress_when(predicate)
}

/// A `302 Found` pointing at `location`
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
    }
}

/// Host prefix every request is normalized to
#[derive(Debug, Clone)]
pub struct CanonicalPrefix(pub Arc<str>);

impl CanonicalPrefix {
    pub fn new(prefix: &str) -> Self {
        Self(Arc::from(prefix))
    }

    /// Whether `host` already carries the prefix
    pub fn is_canonical(&self, host: &str) -> bool {
        let prefix = self.0.as_bytes();
        prefix.is_empty()
            || (host.len() >= prefix.len() && host.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix))
    }
}

/// Redirect hosts lacking the canonical prefix to their prefixed form
pub async fn normalize_host(State(prefix): State<CanonicalPrefix>, req: Request, next: Next) -> Response {
    let host = match request_host(req.headers(), req.uri()) {
        Some(host) if !host.is_empty() => host,
        _ => return (StatusCode::BAD_REQUEST, "Missing Host").into_response(),
    };

    if prefix.is_canonical(&host) {
        return next.run(req).await;
    }

    let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let location = format!("https://{}{}{}", prefix.0, host, path);
    debug!("Normalizing {} to {}", host, location);
    found(&location)
}

/// Wrap the routing handler in the full middleware chain
pub fn apply(router: Router, canonical_prefix: &str) -> Router {
    let stages = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(compression_layer())
        .layer(hsts_layer())
        .layer(middleware::from_fn_with_state(
            CanonicalPrefix::new(canonical_prefix),
            normalize_host,
        ));
    router.layer(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app() -> Router {
        let inner = Router::new()
            .route("/teapot", axum::routing::get(|| async { StatusCode::IM_A_TEAPOT }))
            .route("/big", axum::routing::get(|| async { "x".repeat(8 * 1024) }))
            .fallback(|| async { "routed" });
        apply(inner, "www.")
    }

    fn get(host: &str, path: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_is_canonical() {
        let prefix = CanonicalPrefix::new("www.");
        assert!(prefix.is_canonical("www.example.com"));
        assert!(prefix.is_canonical("WWW.example.com"));
        assert!(!prefix.is_canonical("example.com"));
        assert!(!prefix.is_canonical("ww"));
        assert!(CanonicalPrefix::new("").is_canonical("example.com"));
    }

    #[tokio::test]
    async fn test_bare_host_is_redirected() {
        let resp = app().oneshot(get("example.com", "/x?y=1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://www.example.com/x?y=1"
        );
        assert_eq!(resp.headers().get(header::STRICT_TRANSPORT_SECURITY).unwrap(), HSTS_VALUE);
    }

    #[tokio::test]
    async fn test_www_host_passes_through() {
        let resp = app().oneshot(get("www.example.com", "/x")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"routed");
    }

    #[tokio::test]
    async fn test_hsts_preserves_status() {
        let resp = app().oneshot(get("www.example.com", "/teapot")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(resp.headers().get(header::STRICT_TRANSPORT_SECURITY).unwrap(), HSTS_VALUE);
    }

    #[tokio::test]
    async fn test_gzip_when_accepted() {
        let mut req = get("www.example.com", "/big");
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");

        let resp = app().oneshot(get("www.example.com", "/big")).await.unwrap();
        assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 8 * 1024);
    }

    #[tokio::test]
    async fn test_small_responses_not_compressed() {
        let mut req = get("www.example.com", "/x");
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let resp = app().oneshot(req).await.unwrap();
        assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
    }
}
