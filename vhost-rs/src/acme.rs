//! Certificate provisioning
//!
//! [`CertManager`] is the certificate provider used by the TLS listener. For
//! every handshake it checks the host policy, then serves a certificate from
//! memory, from the on-disk cache, or freshly issued through a
//! [`CertificateIssuer`]. Issuance is serialized per hostname so concurrent
//! first requests for a new host trigger exactly one issuance.
//!
//! The ACME exchange itself lives behind [`CertificateIssuer`]; an issuer
//! proves domain control by publishing HTTP-01 tokens or TLS-ALPN-01
//! certificates in the shared [`ChallengeStore`].

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{DirCache, StoredCertificate};
use crate::error::{ProxyError, Result};
use crate::policy::HostPolicy;
use crate::tls::{certified_key_from_pem, not_after, ALPN_ACME_TLS};

/// Certificates expiring within this window are renewed
pub const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Interval of the background renewal sweep
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// What the TLS listener learned from a ClientHello
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    /// SNI server name, if the client sent one
    pub server_name: Option<String>,
    /// Offered ALPN protocols
    pub alpn: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: Some(server_name.to_string()),
            alpn: Vec::new(),
        }
    }

    /// A TLS-ALPN-01 validation offers `acme-tls/1` and nothing else
    pub fn is_tls_alpn_challenge(&self) -> bool {
        self.alpn.len() == 1 && self.alpn[0] == ALPN_ACME_TLS
    }
}

/// Capability required by the TLS and plaintext listeners
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Certificate for a handshake; an error aborts the handshake
    async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>>;

    /// Key authorization to serve at `/.well-known/acme-challenge/{token}`
    async fn http01_response(&self, host: &str, token: &str) -> Option<String>;
}

/// ACME challenge storage for HTTP-01 and TLS-ALPN-01 validation
pub struct ChallengeStore {
    /// Map of token -> key authorization
    challenges: RwLock<HashMap<String, String>>,
    /// Map of domain -> TLS-ALPN-01 challenge certificate
    alpn_certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeStore {
    /// Create a new challenge store
    pub fn new() -> Self {
        Self {
            challenges: RwLock::new(HashMap::new()),
            alpn_certs: RwLock::new(HashMap::new()),
        }
    }

    /// Add a challenge response
    pub async fn add_challenge(&self, token: &str, authorization: &str) {
        let mut challenges = self.challenges.write().await;
        challenges.insert(token.to_string(), authorization.to_string());
        debug!("Added ACME challenge for token: {}", token);
    }

    /// Get a challenge response
    pub async fn get_challenge(&self, token: &str) -> Option<String> {
        let challenges = self.challenges.read().await;
        challenges.get(token).cloned()
    }

    /// Remove a challenge (after validation)
    pub async fn remove_challenge(&self, token: &str) {
        let mut challenges = self.challenges.write().await;
        challenges.remove(token);
        debug!("Removed ACME challenge for token: {}", token);
    }

    /// Publish a TLS-ALPN-01 certificate for `domain`
    pub async fn add_alpn_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.alpn_certs.write().await.insert(domain.to_string(), cert);
        debug!("Added TLS-ALPN challenge certificate for {}", domain);
    }

    pub async fn get_alpn_cert(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.alpn_certs.read().await.get(domain).cloned()
    }

    pub async fn remove_alpn_cert(&self, domain: &str) {
        self.alpn_certs.write().await.remove(domain);
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A certificate request handed to the issuer
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    pub domain: &'a str,
    pub contact_email: Option<&'a str>,
}

/// Obtains new certificates, typically from an ACME certificate authority
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: IssueRequest<'_>, challenges: &ChallengeStore) -> Result<StoredCertificate>;
}

/// Issues self-signed certificates; for development and tests
#[derive(Debug, Clone, Default)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, request: IssueRequest<'_>, _challenges: &ChallengeStore) -> Result<StoredCertificate> {
        warn!("Issuing self-signed certificate for {}", request.domain);

        let cert = rcgen::generate_simple_self_signed(vec![request.domain.to_string()])
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate certificate: {}", e)))?;

        Ok(StoredCertificate {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
        })
    }
}

#[derive(Clone)]
struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: Option<SystemTime>,
}

impl CachedCert {
    fn parse(stored: &StoredCertificate) -> Result<Self> {
        let key = certified_key_from_pem(stored.cert_pem.as_bytes(), stored.key_pem.as_bytes())?;
        let not_after = not_after(&key);
        Ok(Self {
            key: Arc::new(key),
            not_after,
        })
    }

    /// Due for renewal: expires within `window`. Unknown expiry never is.
    fn needs_renewal(&self, window: Duration) -> bool {
        match self.not_after {
            Some(expiry) => expiry
                .duration_since(SystemTime::now())
                .map(|left| left < window)
                .unwrap_or(true),
            None => false,
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.not_after, Some(expiry) if expiry <= SystemTime::now())
    }
}

/// Policy-gated certificate provider with memory and disk caches
pub struct CertManager {
    policy: HostPolicy,
    cache: DirCache,
    issuer: Arc<dyn CertificateIssuer>,
    contact_email: Option<String>,
    challenges: Arc<ChallengeStore>,
    certs: RwLock<HashMap<String, CachedCert>>,
    /// One lock per hostname; holders are the only ones allowed to issue
    issuing: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    renew_before: Duration,
}

impl CertManager {
    /// Create a new certificate manager
    pub fn new(policy: HostPolicy, cache: DirCache, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            policy,
            cache,
            issuer,
            contact_email: None,
            challenges: Arc::new(ChallengeStore::new()),
            certs: RwLock::new(HashMap::new()),
            issuing: StdMutex::new(HashMap::new()),
            renew_before: RENEW_BEFORE,
        }
    }

    pub fn with_contact_email(mut self, email: Option<String>) -> Self {
        self.contact_email = email;
        self
    }

    pub fn with_renew_before(mut self, window: Duration) -> Self {
        self.renew_before = window;
        self
    }

    /// Get the challenge store shared with the issuer
    pub fn challenge_store(&self) -> Arc<ChallengeStore> {
        self.challenges.clone()
    }

    /// Certificate for `host`, issuing one if needed
    pub async fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        if let Err(e) = self.policy.check(&host) {
            warn!("Refusing certificate for {}: not allowed by policy", host);
            return Err(e);
        }

        if let Some(cached) = self.cached(&host).await {
            if !cached.needs_renewal(self.renew_before) {
                return Ok(cached.key);
            }
        }

        self.obtain(&host, false).await
    }

    /// Force a fresh issuance for `host`, keeping the old certificate on failure
    pub async fn renew(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        self.policy.check(&host)?;
        self.obtain(&host, true).await
    }

    /// Hosts currently held in memory
    pub async fn cached_hosts(&self) -> Vec<String> {
        self.certs.read().await.keys().cloned().collect()
    }

    async fn cached(&self, host: &str) -> Option<CachedCert> {
        self.certs.read().await.get(host).cloned()
    }

    fn issue_lock(&self, host: &str) -> Arc<Mutex<()>> {
        let mut locks = self.issuing.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(host.to_string()).or_default().clone()
    }

    /// Drop the lock entry for `host` once nobody holds or awaits it
    fn release_issue_lock(&self, host: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.issuing.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(host);
        }
    }

    async fn obtain(&self, host: &str, force: bool) -> Result<Arc<CertifiedKey>> {
        let lock = self.issue_lock(host);
        let result = {
            let _guard = lock.lock().await;
            self.obtain_locked(host, force).await
        };
        self.release_issue_lock(host, &lock);
        result
    }

    async fn obtain_locked(&self, host: &str, force: bool) -> Result<Arc<CertifiedKey>> {
        // Another handshake may have finished while we waited.
        let mut current = self.cached(host).await;
        if current.is_none() {
            current = self.load_from_disk(host).await;
        }
        if let Some(cert) = &current {
            if !force && !cert.needs_renewal(self.renew_before) {
                self.certs.write().await.insert(host.to_string(), cert.clone());
                return Ok(cert.key.clone());
            }
        }

        match self.issue(host).await {
            Ok(cert) => {
                let key = cert.key.clone();
                self.certs.write().await.insert(host.to_string(), cert);
                Ok(key)
            }
            Err(e) => match current {
                Some(old) if !old.is_expired() => {
                    warn!("Renewal for {} failed, serving existing certificate: {}", host, e);
                    self.certs.write().await.insert(host.to_string(), old.clone());
                    Ok(old.key)
                }
                _ => {
                    error!("Certificate issuance for {} failed: {}", host, e);
                    Err(e)
                }
            },
        }
    }

    async fn load_from_disk(&self, host: &str) -> Option<CachedCert> {
        match self.cache.load(host).await {
            Ok(Some(stored)) => match CachedCert::parse(&stored) {
                Ok(cert) => Some(cert),
                Err(e) => {
                    warn!("Ignoring unreadable cached certificate for {}: {}", host, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read certificate cache for {}: {}", host, e);
                None
            }
        }
    }

    async fn issue(&self, host: &str) -> Result<CachedCert> {
        info!("Requesting certificate for {}", host);
        let request = IssueRequest {
            domain: host,
            contact_email: self.contact_email.as_deref(),
        };
        let stored = self.issuer.issue(request, &self.challenges).await?;
        let cert = CachedCert::parse(&stored)?;

        if let Err(e) = self.cache.store(host, &stored).await {
            warn!("Failed to cache certificate for {}: {}", host, e);
        }
        info!("Certificate for {} provisioned", host);
        Ok(cert)
    }

    /// Renew every certificate close to expiry
    pub async fn renew_due(&self) {
        let due: Vec<String> = {
            let certs = self.certs.read().await;
            certs
                .iter()
                .filter(|(_, c)| c.needs_renewal(self.renew_before))
                .map(|(host, _)| host.clone())
                .collect()
        };

        for host in due {
            info!("Starting certificate renewal for {}", host);
            if let Err(e) = self.renew(&host).await {
                error!("Certificate renewal for {} failed: {}", host, e);
            }
        }
    }

    /// Start background certificate renewal task
    pub fn start_renewal_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                self.renew_due().await;
            }
        })
    }
}

#[async_trait]
impl CertificateProvider for CertManager {
    async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>> {
        let name = match hello.server_name.as_deref() {
            Some(name) if !name.is_empty() => normalize_host(name),
            _ => return Err(ProxyError::Tls("Missing server name".to_string())),
        };

        if hello.is_tls_alpn_challenge() {
            self.policy.check(&name)?;
            return self
                .challenges
                .get_alpn_cert(&name)
                .await
                .ok_or_else(|| ProxyError::Certificate(format!("No TLS-ALPN challenge for {}", name)));
        }

        self.certificate_for(&name).await
    }

    async fn http01_response(&self, host: &str, token: &str) -> Option<String> {
        let response = self.challenges.get_challenge(token).await;
        if response.is_none() {
            debug!("Unknown HTTP-01 token {} for {}", token, host);
        }
        response
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
