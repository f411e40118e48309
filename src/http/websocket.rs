//! The upgrade (WebSocket) pipeline.
//!
//! # Data Flow
//! ```text
//! Client ──upgrade──→ Proxy ──upgrade──→ Backend
//!                       │ 101 from backend
//! Client ←────101────── Proxy
//! Client ←── raw bytes, both directions ──→ Backend
//! ```
//!
//! # Design Decisions
//! - Bytes are spliced after the handshake; frames are never parsed
//! - A non-101 answer from the backend is relayed as a plain response
//! - Upgrades always use the plain transport (no redirect following)

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;

use crate::config::Role;
use crate::error::ProxyError;
use crate::http::body::InboundState;
use crate::http::exchange::WsExchange;
use crate::http::outgoing::setup_outgoing;
use crate::http::transport::Transport;
use crate::http::web_incoming::{apply_x_forwarded, bounded, report_detached, settle_failure};
use crate::pipeline::{Named, Signal, WsPass, WsPassRef};
use crate::proxy::error_handler::{ExchangeOutcome, Failure};
use crate::proxy::events::{ErrorDisposition, EventHooks};
use crate::proxy::ProxyCore;

/// The ws pipeline in its default order.
pub fn default_passes() -> Vec<WsPassRef> {
    vec![Arc::new(CheckMethodAndHeader), Arc::new(XHeaders), Arc::new(Stream)]
}

/// True for `GET` requests asking for `Upgrade: websocket`.
pub fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::GET
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Rejects anything that is not a WebSocket handshake.
pub struct CheckMethodAndHeader;

impl Named for CheckMethodAndHeader {
    fn name(&self) -> &str {
        "check_method_and_header"
    }
}

impl WsPass for CheckMethodAndHeader {
    fn run<'a>(&'a self, ex: &'a mut WsExchange, _proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        let signal = if is_websocket_upgrade(&ex.request.method, &ex.request.headers) {
            Signal::Continue
        } else {
            ex.response.end_with(StatusCode::BAD_REQUEST, Body::empty());
            Signal::Halt
        };
        future::ready(Ok(signal)).boxed()
    }
}

/// `x-forwarded-*` headers with `ws`/`wss` as the protocol.
pub struct XHeaders;

impl Named for XHeaders {
    fn name(&self) -> &str {
        "x_headers"
    }
}

impl WsPass for XHeaders {
    fn run<'a>(&'a self, ex: &'a mut WsExchange, _proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        if ex.options.xfwd {
            let head = ex.head();
            let proto = if head.encrypted { "wss" } else { "ws" };
            apply_x_forwarded(&mut ex.request.headers, &head, proto);
        }
        future::ready(Ok(Signal::Continue)).boxed()
    }
}

/// Performs the upstream handshake and splices the two connections.
pub struct Stream;

impl Named for Stream {
    fn name(&self) -> &str {
        "stream"
    }
}

impl WsPass for Stream {
    fn run<'a>(&'a self, ex: &'a mut WsExchange, proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        Box::pin(stream(ex, proxy))
    }
}

async fn stream(ex: &mut WsExchange, proxy: &ProxyCore) -> Result<Signal, ProxyError> {
    let request = Arc::new(ex.head());
    let events = proxy.events().clone();
    let Some(target) = ex.options.target.clone() else {
        return match events.emit_error(&ProxyError::MissingDestination, &request, None) {
            ErrorDisposition::Handled(Some(replacement)) => {
                ex.response.replace(replacement);
                Ok(Signal::Halt)
            }
            ErrorDisposition::Handled(None) => {
                ex.response.end_with(StatusCode::INTERNAL_SERVER_ERROR, Body::empty());
                Ok(Signal::Halt)
            }
            ErrorDisposition::Unhandled => Err(ProxyError::MissingDestination),
        };
    };

    let outcome = Arc::new(ExchangeOutcome::new(
        Role::Target,
        events.clone(),
        request.clone(),
        target,
        Arc::new(InboundState::default()),
        ex.on_complete().cloned(),
    ));

    let outgoing = match setup_outgoing(&ex.options, &request, Role::Target, true, Body::empty()) {
        Ok(outgoing) => outgoing,
        Err(err) => return settle_failure(&mut ex.response, &outcome, err),
    };
    let (mut parts, body) = outgoing.into_parts();
    events.emit_proxy_req_ws(&mut parts, &request, &ex.options);

    let send = proxy.http().send(Request::from_parts(parts, body));
    let upstream = match bounded(send, ex.options.proxy_timeout).await {
        Ok(upstream) => upstream,
        Err(err) => return settle_failure(&mut ex.response, &outcome, err),
    };

    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(exchange_id = %request.id, status = %upstream.status(), "Upstream refused upgrade");
        let (head, body) = upstream.into_parts();
        ex.response.set_status(head.status);
        *ex.response.headers_mut() = head.headers;
        ex.response.pipe(Body::new(body));
        outcome.complete();
        return Ok(Signal::Halt);
    }

    let Some(client) = ex.take_upgrade() else {
        return settle_failure(&mut ex.response, &outcome, ProxyError::NotUpgradable);
    };

    ex.response.set_status(StatusCode::SWITCHING_PROTOCOLS);
    *ex.response.headers_mut() = upstream.headers().clone();
    ex.response.end();

    tokio::spawn(splice(client, upstream, ex.upgrade_head.take(), outcome, events));
    Ok(Signal::Halt)
}

async fn splice(
    client: OnUpgrade,
    upstream: Response<Incoming>,
    head: Option<Bytes>,
    outcome: Arc<ExchangeOutcome>,
    events: Arc<EventHooks>,
) {
    let (client, upstream) = match tokio::join!(client, hyper::upgrade::on(upstream)) {
        (Ok(client), Ok(upstream)) => (client, upstream),
        (Err(e), _) | (_, Err(e)) => {
            report_detached(&outcome, ProxyError::Upgrade(e));
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    if let Some(head) = head.filter(|h| !h.is_empty()) {
        if let Err(e) = upstream.write_all(&head).await {
            report_detached(&outcome, ProxyError::Io(e));
            return;
        }
    }

    let request = outcome.request().clone();
    events.emit_open(&request);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(exchange_id = %request.id, sent, received, "Upgraded connection closed");
            outcome.complete();
        }
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
            ) =>
        {
            tracing::debug!(exchange_id = %request.id, error = %e, "Upgraded connection reset");
            outcome.complete();
        }
        Err(e) => {
            if let Failure::Unhandled(err) = outcome.fail(ProxyError::Io(e)) {
                tracing::error!(exchange_id = %request.id, error = %err, "Unhandled proxy error");
            }
        }
    }
    events.emit_close(&request);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_websocket_handshakes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&Method::GET, &headers));
        assert!(!is_websocket_upgrade(&Method::POST, &headers));

        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&Method::GET, &headers));
        assert!(!is_websocket_upgrade(&Method::GET, &HeaderMap::new()));
    }

    #[test]
    fn default_order() {
        let names: Vec<_> = default_passes().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["check_method_and_header", "x_headers", "stream"]);
    }
}
