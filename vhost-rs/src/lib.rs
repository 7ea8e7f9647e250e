//! vhost-rs: multi-tenant TLS-terminating reverse proxy
//!
//! Routes inbound HTTPS requests to backend services by host/path regular
//! expressions and provisions certificates on demand for the hosts it fronts.
//!
//! # Features
//!
//! - Ordered regex routing table (first match wins, `host+path` or `host`)
//! - Per-connection certificate selection by SNI, gated by a host policy
//! - HTTP-01 and TLS-ALPN-01 challenge plumbing for certificate issuers
//! - Plaintext listener redirecting to HTTPS
//! - HSTS and gzip on every proxied response
//! - Canonical `www.` host normalization
//!
//! # Example Configuration
//!
//! ```toml
//! cache_dir = "/var/lib/vhost-rs/certs"
//! allowed_hosts = ['(www\.)?example\.com']
//! contact_email = "admin@example.com"
//!
//! [server]
//! https_addr = "0.0.0.0:443"
//! http_addr = "0.0.0.0:80"
//!
//! [[hosts]]
//! route = '^www\.example\.com/blog'
//! target = "http://127.0.0.1:9001"
//!
//! [[hosts]]
//! route = '^www\.example\.com'
//! target = "http://127.0.0.1:9000"
//! ```

pub mod acme;
pub mod backend;
pub mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod proxy;
pub mod router;
pub mod tls;

pub use acme::{CertManager, CertificateProvider};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use policy::HostPolicy;
pub use proxy::ProxyServer;
pub use router::RouteTable;
