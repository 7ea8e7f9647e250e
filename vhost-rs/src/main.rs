//! vhost-rs: TLS-terminating reverse proxy server
//!
//! Serves HTTPS on the configured TLS address, minting certificates on
//! demand for allowed hosts, and redirects plaintext traffic to HTTPS.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vhost_rs::acme::{CertManager, SelfSignedIssuer};
use vhost_rs::cache::DirCache;
use vhost_rs::{ProxyConfig, ProxyServer};

#[derive(Parser)]
#[command(name = "vhost-rs")]
#[command(about = "TLS-terminating reverse proxy with on-demand certificates", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Primary host name for the site (overrides `site` in the config)
    #[arg(long)]
    site: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vhost_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(ref config_path) = cli.conf {
        info!("Loading configuration from {}", config_path.display());
        ProxyConfig::from_file(config_path)?
    } else {
        info!("No config file specified, using development defaults");
        ProxyConfig::development()
    };
    if let Some(site) = cli.site {
        config.site = site;
    }

    let span = tracing::info_span!("vhost", site = %config.site);
    run(config).instrument(span).await
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    info!("Starting vhost-rs v{}", env!("CARGO_PKG_VERSION"));

    // Configuration errors end here, before any listener is bound.
    config.validate()?;
    let policy = config.host_policy()?;

    if let Some(ref email) = config.contact_email {
        info!("ACME contact: {}", email);
    }
    info!("Certificate cache: {}", config.cache_dir.display());

    let cert_manager = Arc::new(
        CertManager::new(policy, DirCache::new(&config.cache_dir), Arc::new(SelfSignedIssuer))
            .with_contact_email(config.contact_email.clone()),
    );
    cert_manager.clone().start_renewal_task();

    let server = ProxyServer::new(config, cert_manager).await?;
    server.run().await?;

    Ok(())
}
