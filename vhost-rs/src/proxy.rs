//! Proxy server: the TLS listener and the plaintext redirect listener

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::acme::CertificateProvider;
use crate::backend::{http_client, request_host, BackendDispatcher};
use crate::config::ProxyConfig;
use crate::conn::{serve_connection, ConnectionLimits};
use crate::error::{ProxyError, Result};
use crate::middleware::{self, found};
use crate::router::RouteTable;
use crate::tls::{Handshake, TlsTerminator};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared proxy state
pub struct ProxyState {
    /// Routing table, one entry per configured host route
    pub routes: RouteTable<BackendDispatcher>,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<ProxyState>,
    provider: Arc<dyn CertificateProvider>,
    limits: ConnectionLimits,
}

impl ProxyServer {
    /// Create a new proxy server
    ///
    /// Validates the configuration and registers every host route. Any error
    /// here is a configuration error and the caller must not start serving.
    pub async fn new(config: ProxyConfig, provider: Arc<dyn CertificateProvider>) -> Result<Self> {
        config.validate()?;

        let client = http_client();
        let routes = RouteTable::new();
        for host in &config.hosts {
            let dispatcher = BackendDispatcher::new(host, client.clone())?;
            routes.register(&host.route, dispatcher).await?;
        }

        let limits = ConnectionLimits::from_config(&config.server);
        Ok(Self {
            config,
            state: Arc::new(ProxyState { routes }),
            provider,
            limits,
        })
    }

    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    /// Build the router served behind TLS
    pub fn router(&self) -> Router {
        let routes = Router::new()
            .fallback(proxy_handler)
            .with_state(self.state.clone());
        middleware::apply(routes, &self.config.server.canonical_prefix)
    }

    /// Build the router served on the plaintext port
    pub fn redirect_router(&self) -> Router {
        let state = RedirectState {
            provider: self.provider.clone(),
            https_port: self.config.server.https_port(),
        };
        Router::new()
            .route("/.well-known/acme-challenge/:token", any(acme_challenge))
            .fallback(redirect_to_https)
            .with_state(state)
    }

    /// Bind both listeners and serve until the TLS listener fails
    pub async fn run(&self) -> Result<()> {
        info!("Configured routes:");
        for host in &self.config.hosts {
            info!("  {} -> {}", host.route, host.target);
        }

        let tls_listener = TcpListener::bind(&self.config.server.https_addr).await?;
        let http_listener = TcpListener::bind(&self.config.server.http_addr).await?;

        let redirect = self.redirect_router();
        let limits = self.limits;
        tokio::spawn(async move {
            if let Err(e) = serve_redirect(http_listener, redirect, limits).await {
                error!("HTTP redirect server error: {}", e);
            }
        });

        self.serve_tls(tls_listener).await
    }

    /// Accept TLS connections on `listener`
    pub async fn serve_tls(&self, listener: TcpListener) -> Result<()> {
        info!("Starting HTTPS server on {}", listener.local_addr()?);

        let terminator = TlsTerminator::new(self.provider.clone(), self.limits.read_timeout);
        let router = self.router();

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let terminator = terminator.clone();
            let router = router.clone();
            let limits = self.limits;

            tokio::spawn(async move {
                match terminator.accept(stream).await {
                    Ok(Handshake::Serving { stream, server_name }) => {
                        debug!(server_name = %server_name, peer = %addr, "TLS handshake complete");
                        serve_connection(stream, addr, router, limits).await;
                    }
                    Ok(Handshake::ChallengeAnswered { server_name }) => {
                        info!("Answered TLS-ALPN challenge for {}", server_name);
                    }
                    Err(e) => {
                        error!("TLS handshake failed from {}: {}", addr, e);
                    }
                }
            });
        }
    }

    /// Accept plaintext connections on `listener`
    pub async fn serve_redirect(&self, listener: TcpListener) -> Result<()> {
        serve_redirect(listener, self.redirect_router(), self.limits).await
    }
}

async fn serve_redirect(listener: TcpListener, router: Router, limits: ConnectionLimits) -> Result<()> {
    info!("Starting HTTP redirect server on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let router = router.clone();
        tokio::spawn(serve_connection(stream, addr, router, limits));
    }
}

/// Main proxy handler - routes the request and forwards it to its backend
async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response {
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();
    let path = req.uri().path().to_string();
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    debug!("Proxying request: {} {} {}", req.method(), host, path);

    let matched = match state.routes.dispatch(&host, &path).await {
        Ok(m) => m,
        Err(e @ ProxyError::RouteNotFound { .. }) => {
            warn!("{}", e);
            return (StatusCode::NOT_FOUND, "404 page not found").into_response();
        }
        Err(e) => {
            error!("Routing failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
        }
    };

    debug!(
        pattern = %matched.pattern,
        target = %matched.handler.target(),
        mount = matched.mount.as_deref().unwrap_or(""),
        "Forwarding to {}",
        matched.forward_path
    );
    matched.handler.forward(req, &matched.forward_path, client_addr).await
}

#[derive(Clone)]
struct RedirectState {
    provider: Arc<dyn CertificateProvider>,
    https_port: u16,
}

/// Answer an ACME HTTP-01 probe
async fn acme_challenge(
    State(state): State<RedirectState>,
    Path(token): Path<String>,
    req: Request<Body>,
) -> Response {
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();
    let host = strip_port(&host);

    match state.provider.http01_response(host, &token).await {
        Some(authorization) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            authorization,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "404 page not found").into_response(),
    }
}

/// Send every other plaintext request to HTTPS
async fn redirect_to_https(State(state): State<RedirectState>, req: Request<Body>) -> Response {
    let host = match request_host(req.headers(), req.uri()) {
        Some(host) if !host.is_empty() => host,
        _ => return (StatusCode::BAD_REQUEST, "Missing Host").into_response(),
    };
    let host = strip_port(&host);
    let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let location = if state.https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, state.https_port, path)
    };
    found(&location)
}

/// Host without a trailing `:port` (IPv6 literals keep their brackets)
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{CertManager, SelfSignedIssuer};
    use crate::cache::DirCache;
    use crate::config::HostRoute;
    use crate::policy::HostPolicy;
    use tower::ServiceExt;

    fn test_config() -> ProxyConfig {
        let mut config = ProxyConfig::development();
        config.server.https_addr = "127.0.0.1:0".to_string();
        config.server.http_addr = "127.0.0.1:0".to_string();
        config.hosts = vec![HostRoute {
            route: r"^www\.example\.com/blog".to_string(),
            target: "http://127.0.0.1:9001".to_string(),
        }];
        config
    }

    fn provider() -> Arc<dyn CertificateProvider> {
        let policy = HostPolicy::exact(["www.example.com"]);
        Arc::new(CertManager::new(
            policy,
            DirCache::new(std::env::temp_dir().join("vhost-rs-proxy-tests")),
            Arc::new(SelfSignedIssuer),
        ))
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[tokio::test]
    async fn test_proxy_server_creation() {
        let server = ProxyServer::new(test_config(), provider()).await;
        assert!(server.is_ok());
        assert_eq!(server.unwrap().state().routes.len().await, 1);
    }

    #[tokio::test]
    async fn test_bad_route_is_fatal() {
        let mut config = test_config();
        config.hosts[0].route = "(".to_string();
        let err = ProxyServer::new(config, provider()).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unrouted_path_is_not_found() {
        let server = ProxyServer::new(test_config(), provider()).await.unwrap();
        let req = Request::builder()
            .uri("/unknown")
            .header(header::HOST, "www.example.com")
            .body(Body::empty())
            .unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().contains_key(header::STRICT_TRANSPORT_SECURITY));
    }

    #[tokio::test]
    async fn test_plaintext_redirects_to_https() {
        let mut config = test_config();
        config.server.https_addr = "0.0.0.0:443".to_string();
        let server = ProxyServer::new(config, provider()).await.unwrap();
        let req = Request::builder()
            .uri("/blog/post1?x=1")
            .header(header::HOST, "example.com:80")
            .body(Body::empty())
            .unwrap();

        let resp = server.redirect_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://example.com/blog/post1?x=1"
        );
    }

    #[tokio::test]
    async fn test_redirect_keeps_non_default_https_port() {
        let mut config = test_config();
        config.server.https_addr = "0.0.0.0:8443".to_string();
        let server = ProxyServer::new(config, provider()).await.unwrap();
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "www.example.com")
            .body(Body::empty())
            .unwrap();

        let resp = server.redirect_router().oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://www.example.com:8443/"
        );
    }

    #[tokio::test]
    async fn test_unknown_challenge_token_is_not_found() {
        let server = ProxyServer::new(test_config(), provider()).await.unwrap();
        let req = Request::builder()
            .uri("/.well-known/acme-challenge/nope")
            .header(header::HOST, "www.example.com")
            .body(Body::empty())
            .unwrap();

        let resp = server.redirect_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
