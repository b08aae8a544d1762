//! Single-host reverse proxy
//!
//! Every request arriving over TLS is forwarded to the one configured
//! backend. The path is joined onto the target's base path, the query is
//! merged with the target's, and the client's `Host` is kept.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, trace, warn};
use url::Url;

use crate::builtin_handlers::{bad_gateway, health_response};

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap bytes in a [`ProxyBody`]
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Headers that apply to a single hop and are never forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Forwards requests to a fixed backend
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    target: Url,
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    health_path: Option<String>,
}

impl ReverseProxy {
    /// Build the proxy and its backend client
    ///
    /// # Errors
    ///
    /// Fails if the TLS client configuration for `https` backends cannot be
    /// built.
    pub fn new(target: Url, health_path: Option<String>) -> Result<Self, rustls::Error> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::aws_lc_rs::default_provider())?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Ok(Self {
            target,
            client,
            health_path,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Serve one request received over TLS
    ///
    /// Backend failures become `502 Bad Gateway`; the error never leaves
    /// this request.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        if self.health_path.as_deref() == Some(req.uri().path()) {
            trace!("Answering health check");
            return health_response();
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let outgoing = match self.prepare(req, client_addr) {
            Ok(req) => req,
            Err(e) => {
                warn!(path = %path, error = %e, "Cannot build backend request");
                return bad_gateway();
            }
        };

        match self.client.request(outgoing).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                debug!(
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    "Proxied request"
                );
                response.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(
                    method = %method,
                    path = %path,
                    backend = %self.target,
                    error = %e,
                    "Backend request failed"
                );
                bad_gateway()
            }
        }
    }

    fn prepare(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Request<Incoming>, http::Error> {
        // HTTP/2 carries the host in the authority only
        if !req.headers().contains_key(header::HOST) {
            if let Some(authority) = req.uri().authority() {
                let value = HeaderValue::from_str(authority.as_str())?;
                req.headers_mut().insert(header::HOST, value);
            }
        }

        let uri = rewrite_uri(&self.target, req.uri())?;
        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        append_forwarded_for(headers, client_addr);
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("https"));

        Ok(req)
    }
}

/// Build the backend URI for a request URI
///
/// The request path is appended to the target path with exactly one slash
/// between them. Queries of the target and the request are joined with `&`.
pub fn rewrite_uri(target: &Url, uri: &Uri) -> Result<Uri, http::Error> {
    let path = join_paths(target.path(), uri.path());
    let path_and_query = match (target.query().filter(|q| !q.is_empty()), uri.query()) {
        (Some(t), Some(r)) if !r.is_empty() => format!("{}?{}&{}", path, t, r),
        (Some(t), _) => format!("{}?{}", path, t),
        (None, Some(r)) => format!("{}?{}", path, r),
        (None, None) => path,
    };

    let authority = match target.port() {
        Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
        None => target.host_str().unwrap_or_default().to_string(),
    };

    let scheme = if target.scheme() == "https" {
        Scheme::HTTPS
    } else {
        Scheme::HTTP
    };

    Ok(Uri::builder()
        .scheme(scheme)
        .authority(Authority::try_from(authority.as_str())?)
        .path_and_query(PathAndQuery::try_from(path_and_query.as_str())?)
        .build()?)
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including those named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
