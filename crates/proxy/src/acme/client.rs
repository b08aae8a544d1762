//! ACME protocol client
//!
//! Drives one HTTP-01 issuance run per call against an RFC 8555 directory
//! using `instant-acme`: account, order, challenge, validation polling,
//! finalization with a fresh key and certificate download.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client as HyperClient};
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use leproxy_config::ProxyConfig;

use super::challenge::ChallengeManager;
use super::error::{AcmeError, IssuanceStep};
use super::record::CertificateRecord;
use super::retry::{poll_until, with_retry, PollPolicy, PollStatus, RetryPolicy};
use super::storage::CertificateStorage;

/// Anything able to obtain a certificate for a single domain
///
/// The certificate manager only talks to this trait, which keeps the
/// protocol client swappable in tests.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Run a complete issuance for `domain`
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, AcmeError>;
}

/// Settings of the protocol client
#[derive(Debug, Clone)]
pub struct AcmeClientConfig {
    pub directory_url: String,
    pub email: Option<String>,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl AcmeClientConfig {
    pub fn from_proxy_config(config: &ProxyConfig) -> Self {
        Self {
            directory_url: config.acme.directory_url.clone(),
            email: config.acme.email.clone(),
            retry: RetryPolicy {
                request_timeout: Duration::from_secs(config.acme.request_timeout_secs),
                max_retries: config.acme.max_retries,
                ..RetryPolicy::default()
            },
            poll: PollPolicy {
                deadline: Duration::from_secs(config.acme.validation_timeout_secs),
                ..PollPolicy::default()
            },
        }
    }
}

/// HTTP transport used for every request to the directory
type DirectoryHttp = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Build the directory transport: aws-lc-rs with the webpki roots
///
/// Plain `http://` directories are accepted so a local test CA can be used.
fn directory_http() -> Result<DirectoryHttp, AcmeError> {
    let connector = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::aws_lc_rs::default_provider())
        .map_err(|e| AcmeError::Rejected {
            step: IssuanceStep::DirectoryDiscovery,
            message: format!("TLS client setup failed: {}", e),
        })?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(HyperClient::builder(TokioExecutor::new()).build(connector))
}

/// Account credentials as persisted, tagged with the directory they belong to
#[derive(Debug, Serialize, Deserialize)]
struct StoredAccount {
    directory_url: String,
    credentials: serde_json::Value,
}

/// Status of the HTTP-01 challenge offered for one authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

/// One challenge published for an order in flight
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub domain: String,
    pub token: String,
    pub challenge_url: String,
    pub status: ChallengeStatus,
}

/// ACME client backed by `instant-acme`
pub struct AcmeClient {
    config: AcmeClientConfig,
    storage: Arc<CertificateStorage>,
    challenges: ChallengeManager,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(
        config: AcmeClientConfig,
        storage: Arc<CertificateStorage>,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            config,
            storage,
            challenges,
            account: OnceCell::new(),
        }
    }

    /// Load the persisted account or register a new one
    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(account) = self.load_account().await? {
                    return Ok(account);
                }
                self.create_account().await
            })
            .await
    }

    async fn load_account(&self) -> Result<Option<Account>, AcmeError> {
        let Some(json) = self
            .storage
            .run_blocking(|s| s.load_credentials_json())
            .await?
        else {
            return Ok(None);
        };

        let stored: StoredAccount = match serde_json::from_str(&json) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Stored ACME account is unreadable, registering a new one");
                return Ok(None);
            }
        };
        if stored.directory_url != self.config.directory_url {
            warn!(
                stored = %stored.directory_url,
                configured = %self.config.directory_url,
                "Stored ACME account belongs to another directory, registering a new one"
            );
            return Ok(None);
        }

        let policy = self.config.retry;
        let credentials = &stored.credentials;
        let http = &directory_http()?;
        let account = with_retry(&policy, IssuanceStep::DirectoryDiscovery, || async move {
            let credentials: AccountCredentials = serde_json::from_value(credentials.clone())
                .map_err(|e| AcmeError::Rejected {
                    step: IssuanceStep::AccountReady,
                    message: format!("invalid stored credentials: {}", e),
                })?;
            Account::from_credentials_and_http(credentials, Box::new(http.clone()))
                .await
                .map_err(|e| classify(IssuanceStep::DirectoryDiscovery, e))
        })
        .await?;

        info!(directory = %self.config.directory_url, "Loaded existing ACME account");
        Ok(Some(account))
    }

    async fn create_account(&self) -> Result<Account, AcmeError> {
        info!(directory = %self.config.directory_url, "Creating new ACME account");

        let contact: Vec<String> = self
            .config
            .email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let contact_refs = contact_refs.as_slice();
        let directory_url = self.config.directory_url.as_str();
        let http = &directory_http()?;

        let (account, credentials) =
            with_retry(&self.config.retry, IssuanceStep::AccountReady, || async move {
                Account::create_with_http(
                    &NewAccount {
                        contact: contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                    Box::new(http.clone()),
                )
                .await
                .map_err(|e| classify(IssuanceStep::AccountReady, e))
            })
            .await?;

        let stored = StoredAccount {
            directory_url: self.config.directory_url.clone(),
            credentials: serde_json::to_value(&credentials)
                .map_err(|e| AcmeError::Storage(Arc::new(e.into())))?,
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| AcmeError::Storage(Arc::new(e.into())))?;
        self.storage
            .run_blocking(move |s| s.save_credentials_json(&json))
            .await?;

        info!("ACME account registered");
        Ok(account)
    }

    async fn run_order(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        let account = self.account().await?;
        let retry = self.config.retry;
        let poll = self.config.poll;

        let identifier = [Identifier::Dns(domain.to_string())];
        let identifiers: &[Identifier] = &identifier;
        let order = with_retry(&retry, IssuanceStep::OrderCreated, || async move {
            account
                .new_order(&NewOrder { identifiers })
                .await
                .map_err(|e| classify(IssuanceStep::OrderCreated, e))
        })
        .await?;
        debug!(domain = %domain, "ACME order created");
        let order = &Mutex::new(order);

        for mut challenge in self.offer_challenges(domain, order).await? {
            let challenge_url = challenge.challenge_url.as_str();
            let challenge_domain = challenge.domain.as_str();

            with_retry(&retry, IssuanceStep::ChallengeSubmitted, || async move {
                order
                    .lock()
                    .await
                    .set_challenge_ready(challenge_url)
                    .await
                    .map_err(|e| classify(IssuanceStep::ChallengeSubmitted, e))
            })
            .await?;
            debug!(domain = %domain, token = %challenge.token, "ACME challenge submitted");

            challenge.status =
                poll_until(&poll, IssuanceStep::PollingValidation, || async move {
                    challenge_status(order, challenge_domain).await
                })
                .await?;
            if challenge.status == ChallengeStatus::Invalid {
                warn!(domain = %domain, token = %challenge.token, "ACME challenge failed validation");
                return Err(AcmeError::Rejected {
                    step: IssuanceStep::PollingValidation,
                    message: format!("HTTP-01 validation failed for {}", challenge_domain),
                });
            }
            info!(domain = %domain, "ACME challenge validated");
        }

        poll_until(&poll, IssuanceStep::PollingValidation, || async move {
            let mut order = order.lock().await;
            let state = order
                .refresh()
                .await
                .map_err(|e| classify(IssuanceStep::PollingValidation, e))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => Ok(PollStatus::Ready(())),
                OrderStatus::Pending | OrderStatus::Processing => Ok(PollStatus::Pending),
                OrderStatus::Invalid => Err(AcmeError::Rejected {
                    step: IssuanceStep::PollingValidation,
                    message: "order became invalid".to_string(),
                }),
            }
        })
        .await?;

        let key_pair = KeyPair::generate().map_err(|e| AcmeError::Certificate(e.to_string()))?;
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        let csr_der: &[u8] = csr.der();

        let already_valid = {
            let mut order = order.lock().await;
            matches!(order.state().status, OrderStatus::Valid)
        };
        if !already_valid {
            with_retry(&retry, IssuanceStep::Finalize, || async move {
                order
                    .lock()
                    .await
                    .finalize(csr_der)
                    .await
                    .map_err(|e| classify(IssuanceStep::Finalize, e))
            })
            .await?;
        }

        poll_until(&poll, IssuanceStep::Finalize, || async move {
            let mut order = order.lock().await;
            let state = order
                .refresh()
                .await
                .map_err(|e| classify(IssuanceStep::Finalize, e))?;
            match state.status {
                OrderStatus::Valid => Ok(PollStatus::Ready(())),
                OrderStatus::Invalid => Err(AcmeError::Rejected {
                    step: IssuanceStep::Finalize,
                    message: "order became invalid after finalization".to_string(),
                }),
                _ => Ok(PollStatus::Pending),
            }
        })
        .await?;

        let chain = with_retry(&retry, IssuanceStep::Download, || async move {
            order
                .lock()
                .await
                .certificate()
                .await
                .map_err(|e| classify(IssuanceStep::Download, e))?
                .ok_or_else(|| AcmeError::Transient {
                    step: IssuanceStep::Download,
                    message: "certificate not yet available".to_string(),
                })
        })
        .await?;

        CertificateRecord::from_pem(domain, chain, key_pair.serialize_pem(), Utc::now())
    }

    /// Publish the HTTP-01 response of every pending authorization
    async fn offer_challenges(
        &self,
        domain: &str,
        order: &Mutex<Order>,
    ) -> Result<Vec<PendingChallenge>, AcmeError> {
        let authorizations =
            with_retry(&self.config.retry, IssuanceStep::ChallengeOffered, || async move {
                order
                    .lock()
                    .await
                    .authorizations()
                    .await
                    .map_err(|e| classify(IssuanceStep::ChallengeOffered, e))
            })
            .await?;

        let order = order.lock().await;
        let mut pending = Vec::new();
        for authz in &authorizations {
            let Identifier::Dns(identifier) = &authz.identifier;
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %identifier, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                _ => {
                    return Err(AcmeError::Rejected {
                        step: IssuanceStep::ChallengeOffered,
                        message: format!(
                            "authorization for {} is {:?}",
                            identifier, authz.status
                        ),
                    });
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::Rejected {
                    step: IssuanceStep::ChallengeOffered,
                    message: format!("no HTTP-01 challenge offered for {}", identifier),
                })?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .register(identifier, &challenge.token, key_authorization.as_str());
            info!(
                domain = %domain,
                token = %challenge.token,
                "HTTP-01 challenge ready"
            );

            pending.push(PendingChallenge {
                domain: identifier.clone(),
                token: challenge.token.clone(),
                challenge_url: challenge.url.clone(),
                status: ChallengeStatus::Pending,
            });
        }
        Ok(pending)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        info!(domain = %domain, directory = %self.config.directory_url, "Requesting certificate");

        let _tokens = ChallengeCleanup {
            challenges: &self.challenges,
            domain,
        };
        let record = self.run_order(domain).await?;

        info!(domain = %domain, expires = %record.not_after, "Certificate obtained");
        Ok(record)
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.config.directory_url)
            .field("has_account", &self.account.initialized())
            .finish()
    }
}

/// Withdraws a run's challenge tokens however the run ends, including when
/// its task is aborted
struct ChallengeCleanup<'a> {
    challenges: &'a ChallengeManager,
    domain: &'a str,
}

impl Drop for ChallengeCleanup<'_> {
    fn drop(&mut self) {
        self.challenges.unregister(self.domain);
    }
}

async fn challenge_status(
    order: &Mutex<Order>,
    domain: &str,
) -> Result<PollStatus<ChallengeStatus>, AcmeError> {
    let authorizations = order
        .lock()
        .await
        .authorizations()
        .await
        .map_err(|e| classify(IssuanceStep::PollingValidation, e))?;

    let status = authorizations
        .iter()
        .find(|authz| {
            let Identifier::Dns(identifier) = &authz.identifier;
            identifier == domain
        })
        .map(|authz| &authz.status);

    Ok(match status {
        Some(AuthorizationStatus::Valid) => PollStatus::Ready(ChallengeStatus::Valid),
        Some(AuthorizationStatus::Pending) | None => PollStatus::Pending,
        Some(_) => PollStatus::Ready(ChallengeStatus::Invalid),
    })
}

/// Map a protocol error onto the retry taxonomy
pub(crate) fn classify(step: IssuanceStep, err: instant_acme::Error) -> AcmeError {
    match err {
        instant_acme::Error::Api(problem) => {
            let kind = problem.r#type.clone().unwrap_or_default();
            let message = format!(
                "{} ({})",
                problem.detail.as_deref().unwrap_or("no detail"),
                if kind.is_empty() { "unknown problem" } else { &kind }
            );
            if is_transient_problem(&kind, problem.status) {
                AcmeError::Transient { step, message }
            } else {
                AcmeError::Rejected { step, message }
            }
        }
        // Transport and decoding failures
        other => AcmeError::Transient {
            step,
            message: other.to_string(),
        },
    }
}

/// Whether a problem document describes a condition worth retrying
///
/// Rate limits are reported as permanent for the run; retrying within
/// seconds cannot lift them.
pub(crate) fn is_transient_problem(kind: &str, status: Option<u16>) -> bool {
    if kind.ends_with(":rateLimited") {
        return false;
    }
    if kind.ends_with(":badNonce") || kind.ends_with(":serverInternal") {
        return true;
    }
    matches!(status, Some(s) if s >= 500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::challenge::ACME_CHALLENGE_PREFIX;
    use crate::acme::record::tests::self_signed;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const DOMAIN: &str = "example.com";
    const TOKEN: &str = "token-1";

    fn challenge_path() -> String {
        format!("{}{}", ACME_CHALLENGE_PREFIX, TOKEN)
    }

    fn acme_response(status: u16) -> ResponseTemplate {
        ResponseTemplate::new(status).insert_header("Replay-Nonce", "nonce")
    }

    fn problem(status: u16, kind: &str) -> ResponseTemplate {
        acme_response(status).set_body_json(json!({
            "type": format!("urn:ietf:params:acme:error:{}", kind),
            "detail": kind,
            "status": status,
        }))
    }

    /// Accepts the challenge only once its key authorization is being served
    struct ChallengeEndpoint {
        challenges: ChallengeManager,
        body: Value,
    }

    impl Respond for ChallengeEndpoint {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            match self.challenges.respond(Some(DOMAIN), &challenge_path()) {
                Some(key_authorization) if key_authorization.starts_with(&format!("{}.", TOKEN)) => {
                    acme_response(200).set_body_json(self.body.clone())
                }
                _ => problem(403, "unauthorized"),
            }
        }
    }

    /// Scripted RFC 8555 directory serving a single order for `DOMAIN`
    struct FakeDirectory {
        server: MockServer,
    }

    impl FakeDirectory {
        async fn start(challenges: &ChallengeManager) -> Self {
            let directory = Self {
                server: MockServer::start().await,
            };
            let server = &directory.server;

            Mock::given(method("GET"))
                .and(path("/directory"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "newNonce": directory.url("/new-nonce"),
                    "newAccount": directory.url("/new-account"),
                    "newOrder": directory.url("/new-order"),
                })))
                .mount(server)
                .await;
            Mock::given(method("HEAD"))
                .and(path("/new-nonce"))
                .respond_with(acme_response(200))
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/new-account"))
                .respond_with(
                    acme_response(201)
                        .insert_header("Location", directory.url("/account/1").as_str())
                        .set_body_json(json!({ "status": "valid" })),
                )
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/new-order"))
                .respond_with(
                    acme_response(201)
                        .insert_header("Location", directory.url("/order/1").as_str())
                        .set_body_json(directory.order("pending")),
                )
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/order/1"))
                .respond_with(acme_response(200).set_body_json(directory.order("ready")))
                .up_to_n_times(1)
                .with_priority(1)
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/order/1"))
                .respond_with(acme_response(200).set_body_json(directory.order("valid")))
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/order/1/finalize"))
                .respond_with(acme_response(200).set_body_json(directory.order("processing")))
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path("/challenge/1"))
                .respond_with(ChallengeEndpoint {
                    challenges: challenges.clone(),
                    body: directory.challenge("processing"),
                })
                .mount(server)
                .await;

            let now = Utc::now();
            let (chain, _) = self_signed(
                DOMAIN,
                now - chrono::Duration::days(1),
                now + chrono::Duration::days(90),
            );
            Mock::given(method("POST"))
                .and(path("/cert/1"))
                .respond_with(acme_response(200).set_body_string(chain))
                .mount(server)
                .await;

            directory
        }

        /// The authorization is pending until the first poll, then `outcome`
        async fn authorize(&self, outcome: &str) {
            Mock::given(method("POST"))
                .and(path("/authz/1"))
                .respond_with(acme_response(200).set_body_json(self.authorization("pending")))
                .up_to_n_times(1)
                .with_priority(1)
                .mount(&self.server)
                .await;
            Mock::given(method("POST"))
                .and(path("/authz/1"))
                .respond_with(acme_response(200).set_body_json(self.authorization(outcome)))
                .mount(&self.server)
                .await;
        }

        /// Answer the next `/new-order` with `response` before the normal order
        async fn fail_next_order(&self, response: ResponseTemplate) {
            Mock::given(method("POST"))
                .and(path("/new-order"))
                .respond_with(response)
                .up_to_n_times(1)
                .with_priority(1)
                .mount(&self.server)
                .await;
        }

        fn url(&self, route: &str) -> String {
            format!("{}{}", self.server.uri(), route)
        }

        fn directory_url(&self) -> String {
            self.url("/directory")
        }

        fn order(&self, status: &str) -> Value {
            json!({
                "status": status,
                "identifiers": [{ "type": "dns", "value": DOMAIN }],
                "authorizations": [self.url("/authz/1")],
                "finalize": self.url("/order/1/finalize"),
                "certificate": self.url("/cert/1"),
            })
        }

        fn challenge(&self, status: &str) -> Value {
            json!({
                "type": "http-01",
                "url": self.url("/challenge/1"),
                "token": TOKEN,
                "status": status,
            })
        }

        fn authorization(&self, status: &str) -> Value {
            json!({
                "identifier": { "type": "dns", "value": DOMAIN },
                "status": status,
                "challenges": [
                    {
                        "type": "dns-01",
                        "url": self.url("/challenge/2"),
                        "token": "dns-token",
                        "status": "pending",
                    },
                    self.challenge("pending"),
                ],
            })
        }

        async fn hits(&self, verb: &str, route: &str) -> usize {
            self.server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .filter(|r| r.method.to_string() == verb && r.url.path() == route)
                .count()
        }
    }

    fn test_client(
        directory: &FakeDirectory,
        storage: &Arc<CertificateStorage>,
        challenges: &ChallengeManager,
    ) -> AcmeClient {
        let config = AcmeClientConfig {
            directory_url: directory.directory_url(),
            email: Some("ops@example.com".to_string()),
            retry: RetryPolicy {
                request_timeout: Duration::from_secs(5),
                max_retries: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            poll: PollPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                deadline: Duration::from_secs(5),
            },
        };
        AcmeClient::new(config, Arc::clone(storage), challenges.clone())
    }

    fn test_storage() -> (TempDir, Arc<CertificateStorage>) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn test_issue_completes_order() {
        let (_temp_dir, storage) = test_storage();
        let challenges = ChallengeManager::new();
        let directory = FakeDirectory::start(&challenges).await;
        directory.authorize("valid").await;

        let client = test_client(&directory, &storage, &challenges);
        let record = client.issue(DOMAIN).await.unwrap();

        assert_eq!(record.domain, DOMAIN);
        assert!(record.is_valid_at(Utc::now()));
        assert!(record.key_pem.contains("PRIVATE KEY"));
        // The challenge endpoint refuses unless the token was already served
        assert_eq!(directory.hits("POST", "/challenge/1").await, 1);
        assert_eq!(directory.hits("POST", "/challenge/2").await, 0);
        assert_eq!(directory.hits("POST", "/order/1/finalize").await, 1);
        assert_eq!(challenges.respond(None, &challenge_path()), None);
    }

    #[tokio::test]
    async fn test_invalid_authorization_is_rejected() {
        let (_temp_dir, storage) = test_storage();
        let challenges = ChallengeManager::new();
        let directory = FakeDirectory::start(&challenges).await;
        directory.authorize("invalid").await;

        let client = test_client(&directory, &storage, &challenges);
        let err = client.issue(DOMAIN).await.unwrap_err();

        assert!(matches!(
            err,
            AcmeError::Rejected {
                step: IssuanceStep::PollingValidation,
                ..
            }
        ));
        assert_eq!(directory.hits("POST", "/challenge/1").await, 1);
        assert_eq!(directory.hits("POST", "/order/1/finalize").await, 0);
        assert_eq!(challenges.respond(None, &challenge_path()), None);
    }

    #[tokio::test]
    async fn test_transient_order_failure_is_retried() {
        let (_temp_dir, storage) = test_storage();
        let challenges = ChallengeManager::new();
        let directory = FakeDirectory::start(&challenges).await;
        directory.authorize("valid").await;
        directory.fail_next_order(problem(500, "serverInternal")).await;

        let client = test_client(&directory, &storage, &challenges);
        client.issue(DOMAIN).await.unwrap();

        assert_eq!(directory.hits("POST", "/new-order").await, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_order_is_not_retried() {
        let (_temp_dir, storage) = test_storage();
        let challenges = ChallengeManager::new();
        let directory = FakeDirectory::start(&challenges).await;
        directory.fail_next_order(problem(429, "rateLimited")).await;

        let client = test_client(&directory, &storage, &challenges);
        let err = client.issue(DOMAIN).await.unwrap_err();

        assert!(matches!(
            err,
            AcmeError::Rejected {
                step: IssuanceStep::OrderCreated,
                ..
            }
        ));
        assert_eq!(directory.hits("POST", "/new-order").await, 1);
    }

    #[tokio::test]
    async fn test_account_persisted_and_reused() {
        let (_temp_dir, storage) = test_storage();
        let challenges = ChallengeManager::new();
        let directory = FakeDirectory::start(&challenges).await;
        directory.authorize("valid").await;

        test_client(&directory, &storage, &challenges)
            .issue(DOMAIN)
            .await
            .unwrap();

        let json = storage.load_credentials_json().unwrap().unwrap();
        let stored: StoredAccount = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.directory_url, directory.directory_url());

        // A fresh client, as after a restart, signs in with the stored key
        test_client(&directory, &storage, &challenges)
            .issue(DOMAIN)
            .await
            .unwrap();

        assert_eq!(directory.hits("POST", "/new-account").await, 1);
        assert_eq!(directory.hits("POST", "/new-order").await, 2);
    }

    #[test]
    fn test_problem_classification() {
        assert!(is_transient_problem(
            "urn:ietf:params:acme:error:badNonce",
            Some(400)
        ));
        assert!(is_transient_problem(
            "urn:ietf:params:acme:error:serverInternal",
            Some(500)
        ));
        assert!(is_transient_problem("", Some(503)));
        assert!(!is_transient_problem(
            "urn:ietf:params:acme:error:rateLimited",
            Some(429)
        ));
        assert!(!is_transient_problem(
            "urn:ietf:params:acme:error:unauthorized",
            Some(403)
        ));
        assert!(!is_transient_problem(
            "urn:ietf:params:acme:error:malformed",
            None
        ));
    }

    #[test]
    fn test_config_from_proxy_config() {
        let mut proxy = ProxyConfig::new(vec!["example.com".to_string()], "http://127.0.0.1:8080")
            .unwrap();
        proxy.acme.request_timeout_secs = 7;
        proxy.acme.max_retries = 5;
        proxy.acme.validation_timeout_secs = 45;
        proxy.acme.email = Some("ops@example.com".to_string());

        let config = AcmeClientConfig::from_proxy_config(&proxy);
        assert_eq!(config.retry.request_timeout, Duration::from_secs(7));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.poll.deadline, Duration::from_secs(45));
        assert_eq!(config.email.as_deref(), Some("ops@example.com"));
    }

    #[tokio::test]
    async fn test_account_for_other_directory_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        storage
            .save_credentials_json(
                r#"{"directory_url": "https://other.example/dir", "credentials": {}}"#,
            )
            .unwrap();

        let proxy =
            ProxyConfig::new(vec!["example.com".to_string()], "http://127.0.0.1:8080").unwrap();
        let client = AcmeClient::new(
            AcmeClientConfig::from_proxy_config(&proxy),
            storage,
            ChallengeManager::new(),
        );

        assert!(client.load_account().await.unwrap().is_none());
    }

    #[test]
    fn test_cleanup_guard_withdraws_tokens() {
        let challenges = ChallengeManager::new();
        challenges.register("example.com", "t1", "k1");
        challenges.register("other.com", "t2", "k2");

        {
            let _guard = ChallengeCleanup {
                challenges: &challenges,
                domain: "example.com",
            };
        }

        let path = |token: &str| format!("/.well-known/acme-challenge/{}", token);
        assert_eq!(challenges.respond(None, &path("t1")), None);
        assert_eq!(challenges.respond(None, &path("t2")), Some("k2".to_string()));
    }
}
