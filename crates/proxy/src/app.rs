//! Process wiring
//!
//! Builds the shared components from a validated [`ProxyConfig`], binds the
//! listeners and runs them until the shutdown token is cancelled.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::ready;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use leproxy_config::ProxyConfig;

use crate::acme::{
    AcmeClient, AcmeClientConfig, AcmeError, CertificateIssuer, CertificateManager,
    CertificateStorage, ChallengeManager, DomainWhitelist, RenewalScheduler, StorageError,
};
use crate::builtin_handlers::{handle_plain_http, health_response, PlainHttpPolicy};
use crate::http_listener::{serve_connection, Listener};
use crate::proxy::ReverseProxy;
use crate::shutdown::ConnectionDrain;
use crate::tls::{AcceptError, TlsAcceptor};

/// Shared state of a running proxy
pub struct ProxyContext {
    config: ProxyConfig,
    storage: Arc<CertificateStorage>,
    challenges: ChallengeManager,
    manager: Arc<CertificateManager>,
    shutdown: CancellationToken,
    drain: ConnectionDrain,
}

impl ProxyContext {
    /// Build the proxy with the ACME client as issuer
    ///
    /// # Errors
    ///
    /// Fails if the certificate cache directory cannot be created.
    pub fn new(config: ProxyConfig) -> Result<Self, StorageError> {
        let storage = Arc::new(CertificateStorage::new(&config.acme.cache_dir)?);
        let challenges = ChallengeManager::new();
        let client = AcmeClient::new(
            AcmeClientConfig::from_proxy_config(&config),
            Arc::clone(&storage),
            challenges.clone(),
        );
        Ok(Self::with_issuer(config, storage, challenges, Arc::new(client)))
    }

    /// Build the proxy around any certificate issuer
    pub fn with_issuer(
        config: ProxyConfig,
        storage: Arc<CertificateStorage>,
        challenges: ChallengeManager,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        let manager = Arc::new(CertificateManager::new(
            DomainWhitelist::new(&config.domains),
            Arc::clone(&storage),
            issuer,
            config.renew_before(),
        ));
        let drain = ConnectionDrain::new(config.shutdown_grace());

        Self {
            config,
            storage,
            challenges,
            manager,
            shutdown: CancellationToken::new(),
            drain,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CertificateStorage> {
        &self.storage
    }

    pub fn manager(&self) -> &Arc<CertificateManager> {
        &self.manager
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Token that stops the proxy when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind every configured listener
    ///
    /// # Errors
    ///
    /// Fails on the first address that cannot be bound, or if the backend
    /// client cannot be built.
    pub async fn bind(self) -> io::Result<BoundProxy> {
        let proxy = ReverseProxy::new(self.config.target.clone(), self.config.health.path.clone())
            .map_err(io::Error::other)?;

        let https = Listener::bind("https", self.config.listen).await?;
        let http = match self.config.http.listen {
            Some(addr) => Some(Listener::bind("http", addr).await?),
            None => {
                warn!("Plain HTTP listener disabled, HTTP-01 validation cannot succeed");
                None
            }
        };
        let health = match self.config.health.address {
            Some(addr) => Some(Listener::bind("health", addr).await?),
            None => None,
        };

        Ok(BoundProxy {
            ctx: self,
            proxy,
            https,
            http,
            health,
        })
    }

    /// Bind and serve until shutdown
    pub async fn run(self) -> io::Result<()> {
        self.bind().await?.serve().await;
        Ok(())
    }

    /// Stop background work after the listeners have closed
    pub fn teardown(&self) {
        self.manager.shutdown();
        self.challenges.clear();
        info!("Proxy shut down");
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("domains", &self.config.domains)
            .field("target", &self.config.target.as_str())
            .field("manager", &self.manager)
            .finish()
    }
}

/// A proxy whose listeners are bound but not yet serving
#[derive(Debug)]
pub struct BoundProxy {
    ctx: ProxyContext,
    proxy: ReverseProxy,
    https: Listener,
    http: Option<Listener>,
    health: Option<Listener>,
}

impl BoundProxy {
    pub fn https_addr(&self) -> io::Result<SocketAddr> {
        self.https.local_addr()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Serve until the shutdown token is cancelled, then drain and tear
    /// down
    pub async fn serve(self) {
        let BoundProxy {
            ctx,
            proxy,
            https,
            http,
            health,
        } = self;
        let config = &ctx.config;

        let loaded = ctx.manager.warm_from_store();
        info!(
            domains = ?config.domains,
            target = %config.target,
            cached_certificates = loaded,
            "Starting proxy"
        );

        let scheduler = tokio::spawn(
            RenewalScheduler::new(Arc::clone(&ctx.manager))
                .with_interval(Duration::from_secs(config.acme.renewal_check_interval_secs))
                .run(ctx.shutdown.clone()),
        );

        let mut listeners = JoinSet::new();

        let acceptor = Arc::new(TlsAcceptor::new(Arc::clone(&ctx.manager)));
        let proxy = Arc::new(proxy);
        listeners.spawn(https.run(
            ctx.shutdown.clone(),
            ctx.drain.clone(),
            move |stream, peer, shutdown| {
                let acceptor = Arc::clone(&acceptor);
                let proxy = Arc::clone(&proxy);
                async move {
                    match acceptor.accept(stream).await {
                        Ok((tls, server_name)) => {
                            debug!(peer = %peer, server_name = %server_name, "Serving TLS connection");
                            serve_connection(tls, peer, shutdown, move |req| {
                                let proxy = Arc::clone(&proxy);
                                async move { proxy.handle(req, peer).await }
                            })
                            .await;
                        }
                        Err(e) => log_handshake_failure(peer, &e),
                    }
                }
            },
        ));

        if let Some(http) = http {
            let challenges = ctx.challenges.clone();
            let policy = PlainHttpPolicy {
                redirect: config.http.redirect,
                health_path: config.health.path.clone(),
                https_port: config.listen.port(),
            };
            listeners.spawn(http.run(
                ctx.shutdown.clone(),
                ctx.drain.clone(),
                move |stream, peer, shutdown| {
                    let challenges = challenges.clone();
                    let policy = policy.clone();
                    serve_connection(stream, peer, shutdown, move |req| {
                        ready(handle_plain_http(&challenges, &policy, &req))
                    })
                },
            ));
        }

        if let Some(health) = health {
            listeners.spawn(health.run(
                ctx.shutdown.clone(),
                ctx.drain.clone(),
                |stream, peer, shutdown| {
                    serve_connection(stream, peer, shutdown, |_req| ready(health_response()))
                },
            ));
        }

        while let Some(result) = listeners.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Listener task failed");
                ctx.shutdown.cancel();
            }
        }

        ctx.teardown();
        if let Err(e) = scheduler.await {
            error!(error = %e, "Renewal scheduler task failed");
        }
    }
}

fn log_handshake_failure(peer: SocketAddr, err: &AcceptError) {
    match err {
        AcceptError::Certificate {
            source: AcmeError::UnauthorizedDomain(_) | AcmeError::MissingServerName,
            ..
        }
        | AcceptError::HandshakeTimeout => {
            debug!(peer = %peer, error = %err, "TLS handshake rejected");
        }
        _ => warn!(peer = %peer, error = %err, "TLS handshake failed"),
    }
}
