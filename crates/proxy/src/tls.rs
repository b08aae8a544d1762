//! TLS termination with on-demand certificates
//!
//! The ClientHello is read before any configuration is chosen. Its SNI is
//! handed to the [`CertificateManager`], which may have to issue a
//! certificate first; only then is the handshake completed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, trace};

use crate::acme::{AcmeError, CertificateManager};

/// Default limit for receiving the ClientHello and for finishing the
/// handshake once a certificate is known
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors terminating a single TLS connection
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the TLS handshake")]
    HandshakeTimeout,

    #[error("no certificate for '{server_name}': {source}")]
    Certificate {
        server_name: String,
        #[source]
        source: AcmeError,
    },

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Resolver returning the one certificate chosen for this connection
#[derive(Debug)]
struct ChosenCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Accepts TLS connections, selecting the certificate from the SNI name
pub struct TlsAcceptor {
    manager: Arc<CertificateManager>,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
    /// Server configuration per domain, rebuilt when the certificate changes
    configs: DashMap<String, (Arc<CertifiedKey>, Arc<ServerConfig>)>,
}

impl TlsAcceptor {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            configs: DashMap::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Complete a TLS handshake on `stream`
    ///
    /// Returns the established stream and the normalized server name. Any
    /// error closes this connection only.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, String), AcceptError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| AcceptError::HandshakeTimeout)??;

        let server_name = start
            .client_hello()
            .server_name()
            .map(leproxy_config::normalize_domain)
            .unwrap_or_default();
        trace!(server_name = %server_name, "Received ClientHello");

        let key = self
            .manager
            .get_certificate(&server_name)
            .await
            .map_err(|source| AcceptError::Certificate {
                server_name: server_name.clone(),
                source,
            })?;
        let config = self.server_config(&server_name, key)?;

        let tls = tokio::time::timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| AcceptError::HandshakeTimeout)??;

        debug!(server_name = %server_name, "TLS handshake complete");
        Ok((tls, server_name))
    }

    fn server_config(
        &self,
        server_name: &str,
        key: Arc<CertifiedKey>,
    ) -> Result<Arc<ServerConfig>, AcceptError> {
        if let Some(entry) = self.configs.get(server_name) {
            let (cached_key, config) = entry.value();
            if Arc::ptr_eq(cached_key, &key) {
                return Ok(Arc::clone(config));
            }
        }

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ChosenCert(Arc::clone(&key))));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs
            .insert(server_name.to_string(), (key, Arc::clone(&config)));
        debug!(server_name = %server_name, "Built TLS configuration");
        Ok(config)
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("configs", &self.configs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::record::tests::record_expiring_in;
    use crate::acme::{CertificateIssuer, CertificateRecord, CertificateStorage, DomainWhitelist};
    use async_trait::async_trait;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct SelfSigned {
        calls: AtomicU32,
        issued: parking_lot::Mutex<Option<CertificateRecord>>,
    }

    #[async_trait]
    impl CertificateIssuer for SelfSigned {
        async fn issue(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = record_expiring_in(domain, 90);
            *self.issued.lock() = Some(record.clone());
            Ok(record)
        }
    }

    fn setup() -> (TempDir, Arc<SelfSigned>, TlsAcceptor) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        let issuer = Arc::new(SelfSigned {
            calls: AtomicU32::new(0),
            issued: parking_lot::Mutex::new(None),
        });
        let manager = Arc::new(CertificateManager::new(
            DomainWhitelist::new(["localhost.test"]),
            storage,
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            Duration::from_secs(30 * 86_400),
        ));
        (temp_dir, issuer, TlsAcceptor::new(manager))
    }

    fn client_config(roots: RootCertStore) -> Arc<rustls::ClientConfig> {
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_handshake_with_issued_certificate() {
        let (_dir, issuer, acceptor) = setup();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (mut tls, name) = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(b"pong").await.unwrap();
            tls.shutdown().await.unwrap();
            (name, buf)
        });

        // The certificate only exists once the server has seen the hello, so
        // the client trusts whatever the issuer produced, checked afterwards
        let client = tokio::spawn(async move {
            let connector = tokio_rustls::TlsConnector::from(client_config_any());
            let mut tls = connector
                .connect(ServerName::try_from("localhost.test").unwrap(), client_io)
                .await
                .unwrap();
            tls.write_all(b"ping").await.unwrap();
            let mut reply = Vec::new();
            tls.read_to_end(&mut reply).await.unwrap();
            let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
            (reply, presented)
        });

        let (name, request) = server.await.unwrap();
        let (reply, presented) = client.await.unwrap();

        assert_eq!(name, "localhost.test");
        assert_eq!(&request, b"ping");
        assert_eq!(reply, b"pong");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

        let issued = issuer.issued.lock().clone().unwrap();
        let expected = issued.certified_key().unwrap();
        assert_eq!(presented, expected.cert[0]);
    }

    #[tokio::test]
    async fn test_unlisted_name_fails_handshake() {
        let (_dir, issuer, acceptor) = setup();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let client = tokio::spawn(async move {
            let connector = tokio_rustls::TlsConnector::from(client_config(RootCertStore::empty()));
            connector
                .connect(ServerName::try_from("evil.test").unwrap(), client_io)
                .await
        });

        let err = acceptor.accept(server_io).await.unwrap_err();
        assert!(matches!(
            err,
            AcceptError::Certificate { source: AcmeError::UnauthorizedDomain(_), .. }
        ));
        assert!(client.await.unwrap().is_err());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    /// Client accepting any server certificate
    fn client_config_any() -> Arc<rustls::ClientConfig> {
        use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
        use rustls::pki_types::{CertificateDer, UnixTime};
        use rustls::{DigitallySignedStruct, SignatureScheme};

        #[derive(Debug)]
        struct AcceptAny(Arc<CryptoProvider>);

        impl ServerCertVerifier for AcceptAny {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                rustls::crypto::verify_tls12_signature(
                    message,
                    cert,
                    dss,
                    &self.0.signature_verification_algorithms,
                )
            }

            fn verify_tls13_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                rustls::crypto::verify_tls13_signature(
                    message,
                    cert,
                    dss,
                    &self.0.signature_verification_algorithms,
                )
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                self.0.signature_verification_algorithms.supported_schemes()
            }
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAny(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}
