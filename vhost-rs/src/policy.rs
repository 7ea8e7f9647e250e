//! Certificate host policy
//!
//! Decides which TLS server names may receive a certificate. The policy is
//! built once at startup and is consulted before any certificate is looked up
//! or issued; a host it rejects never gets one.

use regex::Regex;
use std::collections::HashSet;

use crate::config::HostPolicyMode;
use crate::error::{ProxyError, Result};

/// Allowed-host policy for certificate issuance
#[derive(Debug, Clone)]
pub enum HostPolicy {
    /// Membership in a fixed set of hostnames
    Exact(HashSet<String>),
    /// A single anchored alternation of hostname patterns
    Pattern(Regex),
}

impl HostPolicy {
    /// Allow exactly the given hostnames
    pub fn exact<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        HostPolicy::Exact(hosts.into_iter().map(|h| normalize(h.as_ref())).collect())
    }

    /// Allow hostnames matching any of the given patterns
    ///
    /// The patterns are joined with `|` and anchored on both ends, so
    /// `www\.example\.com` does not admit `www.example.com.evil.net`.
    pub fn wildcard<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("|");

        // An empty alternation would admit every name.
        if joined.is_empty() {
            return Ok(HostPolicy::Exact(HashSet::new()));
        }

        let anchored = format!("^(?:{})$", joined);
        let re = Regex::new(&anchored).map_err(|e| {
            ProxyError::Config(format!("Invalid allowed host pattern '{}': {}", joined, e))
        })?;
        Ok(HostPolicy::Pattern(re))
    }

    /// Build the policy selected by configuration
    pub fn from_config(mode: HostPolicyMode, hosts: &[String]) -> Result<Self> {
        match mode {
            HostPolicyMode::Exact => Ok(Self::exact(hosts)),
            HostPolicyMode::Pattern => Self::wildcard(hosts),
        }
    }

    /// Whether a certificate may be issued or reused for `host`
    pub fn allows(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        match self {
            HostPolicy::Exact(set) => set.contains(&host),
            HostPolicy::Pattern(re) => re.is_match(&host),
        }
    }

    /// Like [`allows`](Self::allows), but as a `Result`
    pub fn check(&self, host: &str) -> Result<()> {
        if self.allows(host) {
            Ok(())
        } else {
            Err(ProxyError::HostNotAllowed(host.to_string()))
        }
    }
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
