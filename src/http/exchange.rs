//! Per-exchange state handed from pass to pass.
//!
//! # Design Decisions
//! - The inbound response is assembled in an [`OutboundResponse`] while the
//!   pipeline runs and turned into a real `Response` once dispatch returns
//! - [`RequestHead`] is a cheap snapshot for hooks and spawned tasks; the
//!   live, mutable head stays on the exchange

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, request, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use url::Url;
use uuid::Uuid;

use crate::config::ResolvedOptions;
use crate::error::ProxyError;

/// Per-call completion callback. Receives failures of the exchange instead
/// of the instance `error` hook and may supply the response to send.
pub type CompletionCallback =
    Arc<dyn Fn(&ProxyError, &RequestHead, &Url) -> Option<Response<Body>> + Send + Sync>;

/// Request extension marking a request that arrived over TLS.
#[derive(Debug, Clone, Copy)]
pub struct Encrypted;

/// Snapshot of the inbound request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub id: Uuid,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub encrypted: bool,
}

impl RequestHead {
    pub(crate) fn from_parts(id: Uuid, parts: &request::Parts) -> Self {
        Self {
            id,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            remote_addr: remote_addr(parts),
            encrypted: is_encrypted(parts),
        }
    }

    /// The `Host` header, falling back to the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }
}

fn remote_addr(parts: &request::Parts) -> Option<SocketAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn is_encrypted(parts: &request::Parts) -> bool {
    parts.extensions.get::<Encrypted>().is_some() || parts.uri.scheme_str() == Some("https")
}

/// Head of the upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// The upstream response as seen by hooks and response passes.
pub struct UpstreamResponse {
    pub head: ResponseHead,
    body: Option<Body>,
}

impl UpstreamResponse {
    pub fn new(head: ResponseHead, body: Body) -> Self {
        Self { head, body: Some(body) }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// Take the body for custom handling. Once taken it is not piped.
    ///
    /// Reading it to the end fires `end`. Dropping it unread settles the
    /// exchange quietly: neither `end` nor `error` fires.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }
}

/// The response being built for the client.
pub struct OutboundResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Body>,
    headers_sent: bool,
    finished: bool,
}

impl Default for OutboundResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
            headers_sent: false,
            finished: false,
        }
    }
}

impl OutboundResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// True once the head is committed; the rewrite chain is skipped then.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Commit the head without finishing the response.
    pub fn send_head(&mut self) {
        self.headers_sent = true;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Finish the response with whatever body is set (empty if none).
    pub fn end(&mut self) {
        self.headers_sent = true;
        self.finished = true;
    }

    /// Finish with the given status and body.
    pub fn end_with(&mut self, status: StatusCode, body: impl Into<Body>) {
        self.status = status;
        self.body = Some(body.into());
        self.end();
    }

    /// Stream `body` to the client as the response body.
    pub fn pipe(&mut self, body: Body) {
        self.body = Some(body);
        self.end();
    }

    /// Replace everything with a ready-made response.
    pub fn replace(&mut self, response: Response<Body>) {
        let (parts, body) = response.into_parts();
        self.status = parts.status;
        self.headers = parts.headers;
        self.body = Some(body);
        self.end();
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(self.body.unwrap_or_else(Body::empty));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// State of one plain HTTP exchange.
pub struct WebExchange {
    pub id: Uuid,
    /// Inbound request head. Passes may edit it before the stream pass.
    pub request: request::Parts,
    pub options: ResolvedOptions,
    pub response: OutboundResponse,
    body: Option<Body>,
    idle_timeout: Option<Duration>,
    on_complete: Option<CompletionCallback>,
}

impl WebExchange {
    pub fn new(
        id: Uuid,
        request: Request<Body>,
        options: ResolvedOptions,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        let (request, body) = request.into_parts();
        Self {
            id,
            request,
            options,
            response: OutboundResponse::new(),
            body: Some(body),
            idle_timeout: None,
            on_complete,
        }
    }

    pub fn head(&self) -> RequestHead {
        RequestHead::from_parts(self.id, &self.request)
    }

    /// Take the inbound body. The stream pass does this; later takers get `None`.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Abort the inbound body once it stalls for `timeout`.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn on_complete(&self) -> Option<&CompletionCallback> {
        self.on_complete.as_ref()
    }
}

/// State of one upgrade exchange.
pub struct WsExchange {
    pub id: Uuid,
    pub request: request::Parts,
    pub options: ResolvedOptions,
    /// What the client sees if the upgrade does not go through.
    pub response: OutboundResponse,
    /// Bytes already read past the request head, written upstream first.
    pub upgrade_head: Option<Bytes>,
    on_upgrade: Option<OnUpgrade>,
    on_complete: Option<CompletionCallback>,
}

impl WsExchange {
    pub fn new(
        id: Uuid,
        request: Request<Body>,
        options: ResolvedOptions,
        upgrade_head: Option<Bytes>,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        let (mut request, _body) = request.into_parts();
        let on_upgrade = request.extensions.remove::<OnUpgrade>();
        Self {
            id,
            request,
            options,
            response: OutboundResponse::new(),
            upgrade_head,
            on_upgrade,
            on_complete,
        }
    }

    pub fn head(&self) -> RequestHead {
        RequestHead::from_parts(self.id, &self.request)
    }

    /// Take the handle that resolves to the client connection once the
    /// 101 response is written.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.on_upgrade.take()
    }

    pub fn on_complete(&self) -> Option<&CompletionCallback> {
        self.on_complete.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_snapshot_reads_connect_info_and_host() {
        let mut request = Request::builder()
            .uri("/foo?bar=1")
            .header(header::HOST, "proxy.example:8080")
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = "10.0.0.7:51000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let (parts, _) = request.into_parts();
        let head = RequestHead::from_parts(Uuid::new_v4(), &parts);
        assert_eq!(head.remote_addr, Some(addr));
        assert_eq!(head.host(), Some("proxy.example:8080"));
        assert!(!head.encrypted);
    }

    #[test]
    fn encrypted_marker_is_detected() {
        let mut request = Request::new(Body::empty());
        request.extensions_mut().insert(Encrypted);
        let (parts, _) = request.into_parts();
        assert!(RequestHead::from_parts(Uuid::new_v4(), &parts).encrypted);
    }

    #[test]
    fn outbound_response_lifecycle() {
        let mut response = OutboundResponse::new();
        assert!(!response.headers_sent());
        assert!(!response.finished());

        response.end_with(StatusCode::NOT_FOUND, "gone");
        assert!(response.headers_sent());
        assert!(response.finished());
        assert_eq!(response.into_response().status(), StatusCode::NOT_FOUND);
    }
}
