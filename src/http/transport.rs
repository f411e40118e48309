//! Outbound transports.
//!
//! # Responsibilities
//! - Pooled HTTP/1.1 clients keyed by scheme (`http`, `https`)
//! - Optional redirect following, selected per call by `follow_redirects`
//!
//! # Design Decisions
//! - Transports resolve to the upstream head; bodies stream afterwards
//! - The redirect transport must replay the body, so it buffers it (capped)

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::error::ProxyError;

/// Largest request body the redirect transport will buffer for replay.
pub const MAX_REDIRECT_BODY: usize = 10 * 1024 * 1024;

/// Sends one outgoing request and resolves to the upstream response head.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request<Body>) -> BoxFuture<'static, Result<Response<Incoming>, ProxyError>>;
}

/// Plain per-scheme transport.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client<HttpConnector, Body>,
    https: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpTransport {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let http = Client::builder(TokioExecutor::new()).build(connector);

        let tls = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let https = Client::builder(TokioExecutor::new()).build(tls);

        Self { http, https }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: Request<Body>) -> BoxFuture<'static, Result<Response<Incoming>, ProxyError>> {
        let response = if request.uri().scheme_str() == Some("https") {
            self.https.request(request)
        } else {
            self.http.request(request)
        };
        Box::pin(async move { response.await.map_err(ProxyError::Upstream) })
    }
}

/// Follows redirects on top of an inner transport.
#[derive(Clone)]
pub struct RedirectTransport<T> {
    inner: T,
    max_redirects: usize,
}

impl<T> RedirectTransport<T> {
    pub fn new(inner: T, max_redirects: usize) -> Self {
        Self { inner, max_redirects }
    }
}

impl<T> Transport for RedirectTransport<T>
where
    T: Transport + Clone + 'static,
{
    fn send(&self, request: Request<Body>) -> BoxFuture<'static, Result<Response<Incoming>, ProxyError>> {
        let inner = self.inner.clone();
        let max_redirects = self.max_redirects;
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let mut body = Limited::new(body, MAX_REDIRECT_BODY)
                .collect()
                .await
                .map_err(ProxyError::Body)?
                .to_bytes();
            let mut method = parts.method;
            let mut uri = parts.uri;
            let mut headers = parts.headers;
            let version = parts.version;
            let mut followed = 0;

            loop {
                let request = build(&method, &uri, version, &headers, body.clone())?;
                let response = inner.send(request).await?;
                let status = response.status();
                if !is_followed(status) {
                    return Ok(response);
                }
                let Some(location) = response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
                    return Ok(response);
                };

                followed += 1;
                if followed > max_redirects {
                    return Err(ProxyError::TooManyRedirects(max_redirects));
                }

                let current = Url::parse(&uri.to_string()).map_err(|_| ProxyError::InvalidRedirect(uri.to_string()))?;
                let next = current
                    .join(location)
                    .map_err(|_| ProxyError::InvalidRedirect(location.to_string()))?;
                if !matches!(next.scheme(), "http" | "https") {
                    return Err(ProxyError::InvalidRedirect(location.to_string()));
                }
                tracing::debug!(status = %status, from = %current, to = %next, "Following redirect");

                let becomes_get = (status == StatusCode::SEE_OTHER && method != Method::HEAD)
                    || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) && method == Method::POST);
                if becomes_get {
                    method = Method::GET;
                    body = Bytes::new();
                    headers.remove(header::CONTENT_LENGTH);
                    headers.remove(header::CONTENT_TYPE);
                    headers.remove(header::TRANSFER_ENCODING);
                }
                if next.origin() != current.origin() {
                    headers.remove(header::AUTHORIZATION);
                    headers.remove(header::PROXY_AUTHORIZATION);
                    headers.remove(header::COOKIE);
                }
                headers.remove(header::HOST);

                uri = next
                    .as_str()
                    .parse::<Uri>()
                    .map_err(|_| ProxyError::InvalidRedirect(next.to_string()))?;
            }
        })
    }
}

fn is_followed(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn build(method: &Method, uri: &Uri, version: Version, headers: &HeaderMap, body: Bytes) -> Result<Request<Body>, ProxyError> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .version(version)
        .body(Body::from(body))?;
    *request.headers_mut() = headers.clone();
    Ok(request)
}

/// Pick the transport for one exchange.
pub fn select(http: &HttpTransport, follow_redirects: bool, max_redirects: usize) -> Arc<dyn Transport> {
    if follow_redirects {
        Arc::new(RedirectTransport::new(http.clone(), max_redirects))
    } else {
        Arc::new(http.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_redirect_statuses_are_followed() {
        assert!(is_followed(StatusCode::FOUND));
        assert!(is_followed(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_followed(StatusCode::NOT_MODIFIED));
        assert!(!is_followed(StatusCode::MULTIPLE_CHOICES));
        assert!(!is_followed(StatusCode::OK));
    }

    #[test]
    fn replayed_request_keeps_head() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "text/plain".parse().unwrap());
        let uri: Uri = "http://127.0.0.1:9000/x".parse().unwrap();
        let request = build(&Method::PUT, &uri, Version::HTTP_11, &headers, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.headers()[header::ACCEPT], "text/plain");
    }
}
