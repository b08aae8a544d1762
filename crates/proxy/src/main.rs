//! leproxy - Main entry point
//!
//! TLS-terminating reverse proxy with automatic Let's Encrypt certificates.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use leproxy::shutdown::spawn_signal_listener;
use leproxy::ProxyContext;
use leproxy_config::validate::{lint::lint_config, network::validate_target};
use leproxy_config::{ProxyConfig, LETSENCRYPT_STAGING};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// leproxy - Reverse proxy with automatic certificates from Let's Encrypt
#[derive(Parser, Debug)]
#[command(name = "leproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend URL every request is forwarded to
    #[arg(env = "LEPROXY_TARGET")]
    target: String,

    /// Domain to obtain a certificate for (repeatable)
    #[arg(
        short = 'D',
        long = "domain",
        env = "LEPROXY_DOMAINS",
        value_delimiter = ',',
        required = true
    )]
    domains: Vec<String>,

    /// TLS listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// Plain HTTP listen address for challenges and redirects
    #[arg(long = "http-listen", default_value = "0.0.0.0:80")]
    http_listen: SocketAddr,

    /// Serve challenges only, without redirecting other requests to HTTPS
    #[arg(long = "no-http-redirect")]
    no_http_redirect: bool,

    /// Path answered with 200 OK instead of being proxied
    #[arg(short = 'H', long = "health")]
    health: Option<String>,

    /// Dedicated health check listener answering on every path
    #[arg(long = "health-addr")]
    health_addr: Option<SocketAddr>,

    /// Certificate and account cache directory
    #[arg(long = "cache-dir", env = "LEPROXY_CACHE_DIR", default_value = "/var/certs")]
    cache_dir: PathBuf,

    /// Contact e-mail for the ACME account
    #[arg(long, env = "LEPROXY_EMAIL")]
    email: Option<String>,

    /// ACME directory URL
    #[arg(long = "directory-url", conflicts_with = "staging")]
    directory_url: Option<Url>,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    staging: bool,

    /// Renew certificates this many days before expiry
    #[arg(long = "renew-before-days", default_value_t = 30)]
    renew_before_days: u32,

    /// Seconds between background renewal scans
    #[arg(long = "renewal-check-interval-secs", default_value_t = 43_200)]
    renewal_check_interval_secs: u64,

    /// Seconds to let open connections finish on shutdown
    #[arg(long = "shutdown-grace-secs", default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::new(self.domains, &self.target)
            .context("Invalid backend target")?;

        config.listen = self.listen;
        config.http.listen = Some(self.http_listen);
        config.http.redirect = !self.no_http_redirect;
        config.health.path = self.health;
        config.health.address = self.health_addr;

        config.acme.cache_dir = self.cache_dir;
        config.acme.email = self.email;
        if self.staging {
            config.acme.directory_url = LETSENCRYPT_STAGING.to_string();
        } else if let Some(url) = self.directory_url {
            config.acme.directory_url = url.to_string();
        }
        config.acme.renew_before_days = self.renew_before_days;
        config.acme.renewal_check_interval_secs = self.renewal_check_interval_secs;
        config.server.graceful_shutdown_timeout_secs = self.shutdown_grace_secs;

        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let test = cli.test;
    let config = cli.into_config()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    if test {
        return runtime.block_on(test_config(&config));
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    runtime.block_on(run_server(config))
}

/// Check the configuration and the backend, then exit
async fn test_config(config: &ProxyConfig) -> Result<()> {
    let mut result = lint_config(config);
    result.merge(validate_target(config).await);

    for warning in &result.warnings {
        warn!("{}", warning);
    }

    info!("Configuration test successful:");
    info!("  - {} domain(s)", config.domains.len());
    info!("  - target {}", config.target);
    info!("  - {} warning(s)", result.warnings.len());

    println!("leproxy: configuration test is successful");
    Ok(())
}

/// Run the proxy until a shutdown signal arrives
async fn run_server(config: ProxyConfig) -> Result<()> {
    info!(
        domains = ?config.domains,
        target = %config.target,
        listen = %config.listen,
        cache_dir = %config.acme.cache_dir.display(),
        directory = %config.acme.directory_url,
        "Configuration loaded"
    );

    let ctx = ProxyContext::new(config).context("Failed to initialize certificate cache")?;
    spawn_signal_listener(ctx.shutdown_token()).context("Failed to install signal handlers")?;

    ctx.run().await.context("Failed to bind listener")?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("leproxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let config = parse(&["-D", "example.com", "http://127.0.0.1:8080"])
            .into_config()
            .unwrap();

        assert_eq!(config.domains, vec!["example.com".to_string()]);
        assert_eq!(config.listen, "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.http.listen, Some("0.0.0.0:80".parse().unwrap()));
        assert!(config.http.redirect);
        assert_eq!(config.acme.cache_dir, PathBuf::from("/var/certs"));
        assert_eq!(config.acme.directory_url, leproxy_config::LETSENCRYPT_PRODUCTION);
        assert_eq!(config.acme.renew_before_days, 30);
    }

    #[test]
    fn test_cli_overrides() {
        let config = parse(&[
            "--domain",
            "a.example.com,B.example.com",
            "-D",
            "c.example.com",
            "--listen",
            "127.0.0.1:8443",
            "--no-http-redirect",
            "-H",
            "/healthz",
            "--staging",
            "--cache-dir",
            "/tmp/certs",
            "https://backend.internal/app",
        ])
        .into_config()
        .unwrap();

        assert_eq!(
            config.domains,
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
        assert!(!config.http.redirect);
        assert_eq!(config.health.path.as_deref(), Some("/healthz"));
        assert_eq!(config.acme.directory_url, LETSENCRYPT_STAGING);
        assert_eq!(config.target.as_str(), "https://backend.internal/app");
    }

    #[test]
    fn test_cli_requires_domain() {
        let result =
            Cli::try_parse_from(["leproxy", "http://127.0.0.1:8080"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_rejects_bad_target() {
        let result = parse(&["-D", "example.com", "ftp://backend"]).into_config();
        assert!(result.is_err());
    }
}
