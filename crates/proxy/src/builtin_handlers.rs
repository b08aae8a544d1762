//! Built-in responses served by the proxy itself
//!
//! ACME challenge answers, the health check and the HTTP to HTTPS redirect.
//! All handlers are pure functions of the request and shared state so they
//! can be exercised without a listener.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use tracing::{debug, trace};

use crate::acme::{strip_port, ChallengeManager};
use crate::proxy::{full_body, ProxyBody};

/// What the plain HTTP listener does besides answering challenges
#[derive(Debug, Clone)]
pub struct PlainHttpPolicy {
    /// Answer non-challenge requests with a permanent redirect to HTTPS
    pub redirect: bool,
    /// Path answered with `200 OK`
    pub health_path: Option<String>,
    /// Port of the TLS listener, added to redirect targets unless 443
    pub https_port: u16,
}

/// Host a request was addressed to: the `Host` header, else the URI
/// authority (HTTP/2)
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .filter(|h| !h.is_empty())
}

/// Route a request received on the plain HTTP listener
///
/// Order: pending ACME challenge, health path, redirect (if enabled),
/// otherwise 404.
pub fn handle_plain_http<B>(
    challenges: &ChallengeManager,
    policy: &PlainHttpPolicy,
    req: &Request<B>,
) -> Response<ProxyBody> {
    let host = request_host(req);
    let path = req.uri().path();

    if let Some(key_authorization) = challenges.respond(host, path) {
        debug!(host = ?host, path = %path, "Answering ACME challenge");
        return challenge_response(key_authorization);
    }
    if ChallengeManager::extract_token(path).is_some() {
        debug!(host = ?host, path = %path, "Unknown ACME challenge token");
        return not_found();
    }

    if policy.health_path.as_deref() == Some(path) {
        return health_response();
    }

    if policy.redirect {
        return redirect_response(host, req.uri(), policy.https_port);
    }

    trace!(path = %path, "No handler for plain HTTP request");
    not_found()
}

/// Key authorization body for an HTTP-01 challenge
pub fn challenge_response(key_authorization: String) -> Response<ProxyBody> {
    text_response(StatusCode::OK, Bytes::from(key_authorization))
}

/// Health check answer
pub fn health_response() -> Response<ProxyBody> {
    text_response(StatusCode::OK, Bytes::from_static(b"OK"))
}

/// Permanent redirect to the HTTPS URL of the same host, path and query
pub fn redirect_response(host: Option<&str>, uri: &Uri, https_port: u16) -> Response<ProxyBody> {
    let Some(host) = host else {
        return text_response(StatusCode::BAD_REQUEST, Bytes::from_static(b"missing host"));
    };

    let host = strip_port(host);
    let authority = match (host.contains(':'), https_port) {
        (true, 443) => format!("[{}]", host),
        (true, port) => format!("[{}]:{}", host, port),
        (false, 443) => host.to_string(),
        (false, port) => format!("{}:{}", host, port),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", authority, path_and_query);

    match HeaderValue::from_str(&location) {
        Ok(value) => {
            debug!(location = %location, "Redirecting to HTTPS");
            let mut response = Response::new(full_body(Bytes::new()));
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, Bytes::from_static(b"invalid host")),
    }
}

pub fn not_found() -> Response<ProxyBody> {
    text_response(StatusCode::NOT_FOUND, Bytes::from_static(b"not found"))
}

/// Response to a backend that could not be reached
pub fn bad_gateway() -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, Bytes::from_static(b"bad gateway"))
}

fn text_response(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
