//! On-disk certificate cache
//!
//! Layout: `<cache_dir>/certs/<domain>/{cert.pem,key.pem}`.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// PEM encoded certificate chain and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory holding this domain's files
    pub cert_dir: PathBuf,
    /// Certificate chain file path
    pub cert_path: PathBuf,
    /// Private key file path
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// Create certificate paths for a domain
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let cert_dir = base_dir.join("certs").join(domain);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// Directory-backed certificate cache
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Paths for `domain`, refusing names that could escape the cache
    pub fn paths(&self, domain: &str) -> Result<CertificatePaths> {
        let valid = !domain.is_empty()
            && domain != "."
            && domain != ".."
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'));
        if !valid {
            return Err(ProxyError::Certificate(format!(
                "Refusing to cache certificate for {:?}",
                domain
            )));
        }
        Ok(CertificatePaths::for_domain(&self.dir, domain))
    }

    /// Load a cached certificate, `None` when nothing is stored
    pub async fn load(&self, domain: &str) -> Result<Option<StoredCertificate>> {
        let paths = self.paths(domain)?;
        if !paths.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&paths.cert_path).await?;
        let key_pem = fs::read_to_string(&paths.key_path).await?;
        debug!("Loaded cached certificate for {} from {:?}", domain, paths.cert_dir);

        Ok(Some(StoredCertificate { cert_pem, key_pem }))
    }

    /// Store a certificate, replacing any previous one
    pub async fn store(&self, domain: &str, cert: &StoredCertificate) -> Result<()> {
        let paths = self.paths(domain)?;
        fs::create_dir_all(&paths.cert_dir)
            .await
            .map_err(|e| ProxyError::Certificate(format!("Failed to create cert directory: {}", e)))?;

        // Key first: a reader that sees the new cert must also see its key.
        write_atomic(&paths.key_path, &cert.key_pem).await?;
        write_atomic(&paths.cert_path, &cert.cert_pem).await?;
        debug!("Stored certificate for {} in {:?}", domain, paths.cert_dir);
        Ok(())
    }

    /// Remove a cached certificate
    pub async fn remove(&self, domain: &str) -> Result<()> {
        let paths = self.paths(domain)?;
        match fs::remove_dir_all(&paths.cert_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("pem.tmp");
    fs::write(&tmp, contents)
        .await
        .map_err(|e| ProxyError::Certificate(format!("Failed to write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| ProxyError::Certificate(format!("Failed to write {:?}: {}", path, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_certificate_paths() {
        let base = Path::new("/tmp/proxy");
        let paths = CertificatePaths::for_domain(base, "example.com");

        assert_eq!(paths.cert_path, PathBuf::from("/tmp/proxy/certs/example.com/cert.pem"));
        assert_eq!(paths.key_path, PathBuf::from("/tmp/proxy/certs/example.com/key.pem"));
    }

    #[test]
    fn test_paths_reject_traversal() {
        let cache = DirCache::new("/tmp/proxy");
        assert!(cache.paths("../etc").is_err());
        assert!(cache.paths("..").is_err());
        assert!(cache.paths("a/b").is_err());
        assert!(cache.paths("").is_err());
        assert!(cache.paths("www.example.com").is_ok());
    }

    #[tokio::test]
    async fn test_store_load_remove() {
        let dir = tempdir().unwrap();
        let cache = DirCache::new(dir.path());

        assert_eq!(cache.load("www.example.com").await.unwrap(), None);

        let cert = StoredCertificate {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        };
        cache.store("www.example.com", &cert).await.unwrap();
        assert_eq!(cache.load("www.example.com").await.unwrap(), Some(cert));
        assert!(cache.paths("www.example.com").unwrap().exists());

        cache.remove("www.example.com").await.unwrap();
        assert_eq!(cache.load("www.example.com").await.unwrap(), None);
        // Removing twice is fine
        cache.remove("www.example.com").await.unwrap();
    }
}
