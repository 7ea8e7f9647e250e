//! Backend dispatcher
//!
//! One dispatcher per configured host route. It rewrites the inbound request
//! onto the route's target and streams the backend response back.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri},
    response::IntoResponse,
};
use hyper_util::{client::legacy::connect::HttpConnector, client::legacy::Client, rt::TokioExecutor};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

use crate::config::HostRoute;
use crate::error::{ProxyError, Result};

/// HTTP client type for forwarding requests
pub type HttpClient = Client<HttpConnector, Body>;

/// Headers that apply to a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build the shared client used by every dispatcher
pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build_http()
}

/// Parse and validate a backend target URL
pub fn parse_target(target: &str) -> Result<Url> {
    let url = Url::parse(target)
        .map_err(|e| ProxyError::Config(format!("Invalid backend URL '{}': {}", target, e)))?;

    if url.scheme() != "http" {
        return Err(ProxyError::Config(format!(
            "Unsupported backend scheme '{}' in '{}'",
            url.scheme(),
            target
        )));
    }
    if url.host_str().is_none() {
        return Err(ProxyError::Config(format!("Backend URL '{}' has no host", target)));
    }

    Ok(url)
}

/// Reverse proxy for a single host route
#[derive(Clone)]
pub struct BackendDispatcher {
    target: Url,
    authority: String,
    client: HttpClient,
}

impl std::fmt::Debug for BackendDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDispatcher")
            .field("target", &self.target.as_str())
            .finish()
    }
}

impl BackendDispatcher {
    /// Create a dispatcher for `route`, sharing `client`
    pub fn new(route: &HostRoute, client: HttpClient) -> Result<Self> {
        let target = parse_target(&route.target)?;
        let authority = match target.port() {
            Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
            None => target.host_str().unwrap_or_default().to_string(),
        };

        Ok(Self {
            target,
            authority,
            client,
        })
    }

    /// Backend URL this dispatcher forwards to
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Build the backend URI for a forwarded path and query
    pub fn forward_uri(&self, forward_path: &str, query: Option<&str>) -> Result<Uri> {
        let path = join_paths(self.target.path(), forward_path);
        let query = match (self.target.query(), query) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };

        let uri = match query {
            Some(q) => format!("http://{}{}?{}", self.authority, path, q),
            None => format!("http://{}{}", self.authority, path),
        };

        uri.parse::<Uri>()
            .map_err(|e| ProxyError::Http(format!("Invalid forward URI '{}': {}", uri, e)))
    }

    /// Forward `req` to the backend and stream its response back
    ///
    /// Connection failures become `502 Bad Gateway`. Dropping the returned
    /// future or body (client went away) aborts the backend request.
    pub async fn forward(
        &self,
        req: Request<Body>,
        forward_path: &str,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let uri = match self.forward_uri(forward_path, req.uri().query()) {
            Ok(uri) => uri,
            Err(e) => {
                error!("{}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
            }
        };

        debug!("Forwarding {} {} to {}", req.method(), req.uri(), uri);

        let (mut parts, body) = req.into_parts();
        let original_host = request_host(&parts.headers, &parts.uri);
        parts.uri = uri;
        // hyper derives the version per connection to the backend.
        parts.version = axum::http::Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(header::HOST) {
            if let Some(host) = original_host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
                parts.headers.insert(header::HOST, host);
            }
        }
        add_forwarded_headers(&mut parts.headers, client_addr, original_host.as_deref());

        let forward_req = Request::from_parts(parts, body);

        match self.client.request(forward_req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                let e = ProxyError::BackendConnection(format!("{}: {}", self.target, e));
                error!("{}", e);
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
        }
    }
}

/// Host the client asked for: `Host` header, or the URI authority (HTTP/2)
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, client_addr: Option<SocketAddr>, host: Option<&str>) {
    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Some(host) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(target: &str) -> BackendDispatcher {
        let route = HostRoute {
            route: r"^www\.example\.com".to_string(),
            target: target.to_string(),
        };
        BackendDispatcher::new(&route, http_client()).unwrap()
    }

    #[test]
    fn test_parse_target() {
        assert!(parse_target("http://127.0.0.1:9001").is_ok());
        assert!(matches!(parse_target("127.0.0.1:9001"), Err(ProxyError::Config(_))));
        assert!(matches!(parse_target("ftp://example.com"), Err(ProxyError::Config(_))));
        assert!(matches!(parse_target("not a url"), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_forward_uri() {
        let d = dispatcher("http://127.0.0.1:9001");
        assert_eq!(
            d.forward_uri("/post1", None).unwrap().to_string(),
            "http://127.0.0.1:9001/post1"
        );
        assert_eq!(
            d.forward_uri("/post1", Some("page=2")).unwrap().to_string(),
            "http://127.0.0.1:9001/post1?page=2"
        );
    }

    #[tokio::test]
    async fn test_forward_uri_joins_base_path_and_query() {
        let d = dispatcher("http://127.0.0.1:9001/app/?v=1");
        assert_eq!(
            d.forward_uri("/post1", Some("page=2")).unwrap().to_string(),
            "http://127.0.0.1:9001/app/post1?v=1&page=2"
        );

        let d = dispatcher("http://backend.internal/app");
        assert_eq!(
            d.forward_uri("/x", None).unwrap().to_string(),
            "http://backend.internal/app/x"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session").is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[test]
    fn test_forwarded_headers_append() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let addr: SocketAddr = "192.0.2.7:5555".parse().unwrap();

        add_forwarded_headers(&mut headers, Some(addr), Some("www.example.com"));

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 192.0.2.7");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "www.example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let d = dispatcher(&format!("http://{}", addr));
        let req = Request::builder()
            .uri("/x")
            .header(header::HOST, "www.example.com")
            .body(Body::empty())
            .unwrap();

        let resp = d.forward(req, "/x", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
