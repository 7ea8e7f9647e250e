//! TLS termination
//!
//! Certificates are chosen per connection: the ClientHello is read first,
//! the certificate provider is asked for a certificate matching its SNI name,
//! and only then is the handshake completed. A connection therefore moves
//! through `AwaitingHandshake -> CertificateLookup -> Serving`, or stops in
//! `HandshakeFailed` with a transport-level error and no HTTP response.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::acme::{CertificateProvider, ClientHelloInfo};
use crate::error::{ProxyError, Result};

/// ALPN identifier for HTTP/2
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1
pub const ALPN_HTTP1: &[u8] = b"http/1.1";
/// ALPN identifier used by ACME TLS-ALPN-01 validation
pub const ALPN_ACME_TLS: &[u8] = b"acme-tls/1";

/// Protocols advertised on the TLS listener, in preference order
pub fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec(), ALPN_ACME_TLS.to_vec()]
}

/// Parse a PEM certificate chain and private key into a signing certificate
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let chain = certs(&mut &cert_pem[..])
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?;
    if chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".to_string()));
    }

    // Try PKCS8 first, then RSA, then SEC1
    let mut keys = pkcs8_private_keys(&mut &key_pem[..])
        .map_err(|e| ProxyError::Tls(format!("Failed to read PKCS8 keys: {}", e)))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut &key_pem[..])
            .map_err(|e| ProxyError::Tls(format!("Failed to read RSA keys: {}", e)))?;
    }
    if keys.is_empty() {
        keys = ec_private_keys(&mut &key_pem[..])
            .map_err(|e| ProxyError::Tls(format!("Failed to read EC keys: {}", e)))?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::Tls("No private key found in PEM".to_string()))?;

    let signing_key = rustls::sign::any_supported_type(&rustls::PrivateKey(key))
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(
        chain.into_iter().map(rustls::Certificate).collect(),
        signing_key,
    ))
}

/// Expiry of the leaf certificate, if it can be parsed
pub fn not_after(key: &CertifiedKey) -> Option<SystemTime> {
    let leaf = key.cert.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.0).ok()?;
    let secs = cert.validity().not_after.timestamp();
    if secs < 0 {
        return Some(UNIX_EPOCH);
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

/// Resolver that always presents the certificate chosen for this connection
struct ChosenCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCert {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the rustls config used to finish one handshake
pub fn server_config(cert: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ChosenCert(cert)));
    config.alpn_protocols = alpn_protocols();
    Arc::new(config)
}

/// Outcome of a completed handshake
pub enum Handshake<IO> {
    /// The secure channel is up and should be served as HTTP
    Serving {
        stream: TlsStream<IO>,
        server_name: String,
    },
    /// A TLS-ALPN-01 probe; nothing follows the handshake
    ChallengeAnswered { server_name: String },
}

/// Accepts TLS connections, resolving certificates through a provider
#[derive(Clone)]
pub struct TlsTerminator {
    provider: Arc<dyn CertificateProvider>,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    pub fn new(provider: Arc<dyn CertificateProvider>, handshake_timeout: Duration) -> Self {
        Self {
            provider,
            handshake_timeout,
        }
    }

    /// Run the handshake on `io`
    ///
    /// Reading the ClientHello and finishing the handshake are each bounded
    /// by the handshake timeout; the certificate lookup in between is not,
    /// since issuance may legitimately take a while.
    pub async fn accept<IO>(&self, io: IO) -> Result<Handshake<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io);
        let start = tokio::time::timeout(self.handshake_timeout, acceptor)
            .await
            .map_err(|_| ProxyError::Tls("Timed out waiting for ClientHello".to_string()))?
            .map_err(|e| ProxyError::Tls(format!("Invalid ClientHello: {}", e)))?;

        let hello = {
            let client_hello = start.client_hello();
            ClientHelloInfo {
                server_name: client_hello.server_name().map(|s| s.to_string()),
                alpn: client_hello
                    .alpn()
                    .map(|protocols| protocols.map(|p| p.to_vec()).collect())
                    .unwrap_or_default(),
            }
        };

        let server_name = hello.server_name.clone().unwrap_or_default();
        debug!(server_name = %server_name, "Looking up certificate");
        let cert = self.provider.get_certificate(&hello).await?;

        let mut stream = tokio::time::timeout(self.handshake_timeout, start.into_stream(server_config(cert)))
            .await
            .map_err(|_| ProxyError::Tls("Timed out completing handshake".to_string()))?
            .map_err(|e| ProxyError::Tls(format!("Handshake failed: {}", e)))?;

        if stream.get_ref().1.alpn_protocol() == Some(ALPN_ACME_TLS) {
            let _ = stream.shutdown().await;
            return Ok(Handshake::ChallengeAnswered { server_name });
        }

        Ok(Handshake::Serving {
            stream,
            server_name,
        })
    }
}
