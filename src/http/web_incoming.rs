//! The plain HTTP pipeline.
//!
//! ```text
//! delete_length → timeout → x_headers → stream
//! ```
//!
//! `stream` is the terminal pass: it mirrors the request to `forward`
//! (fire-and-forget), relays it to `target`, runs the response rewrite chain
//! and pipes the upstream body back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use futures_util::future::{self, BoxFuture, FutureExt};
use hyper::body::Incoming;

use crate::config::Role;
use crate::error::ProxyError;
use crate::http::body::{drain, tee, InboundBody, InboundState, RelayBody};
use crate::http::exchange::{OutboundResponse, RequestHead, ResponseHead, UpstreamResponse, WebExchange};
use crate::http::outgoing::setup_outgoing;
use crate::pipeline::{Named, Signal, WebPass, WebPassRef};
use crate::proxy::error_handler::{AbandonGuard, ExchangeOutcome, Failure};
use crate::proxy::ProxyCore;

/// The web pipeline in its default order.
pub fn default_passes() -> Vec<WebPassRef> {
    vec![Arc::new(DeleteLength), Arc::new(Timeout), Arc::new(XHeaders), Arc::new(Stream)]
}

/// DELETE and OPTIONS without a length get an explicit zero length.
pub struct DeleteLength;

impl Named for DeleteLength {
    fn name(&self) -> &str {
        "delete_length"
    }
}

impl WebPass for DeleteLength {
    fn run<'a>(&'a self, ex: &'a mut WebExchange, _proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        let request = &mut ex.request;
        if (request.method == Method::DELETE || request.method == Method::OPTIONS)
            && !request.headers.contains_key(header::CONTENT_LENGTH)
        {
            request.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            request.headers.remove(header::TRANSFER_ENCODING);
        }
        future::ready(Ok(Signal::Continue)).boxed()
    }
}

/// Arms the inbound idle timeout. It covers body upload and the wait for
/// the upstream head; on expiry the inbound side counts as aborted.
pub struct Timeout;

impl Named for Timeout {
    fn name(&self) -> &str {
        "timeout"
    }
}

impl WebPass for Timeout {
    fn run<'a>(&'a self, ex: &'a mut WebExchange, _proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        if let Some(timeout) = ex.options.timeout {
            ex.set_idle_timeout(Some(timeout));
        }
        future::ready(Ok(Signal::Continue)).boxed()
    }
}

/// `x-forwarded-*` headers when `xfwd` is set.
pub struct XHeaders;

impl Named for XHeaders {
    fn name(&self) -> &str {
        "x_headers"
    }
}

impl WebPass for XHeaders {
    fn run<'a>(&'a self, ex: &'a mut WebExchange, _proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        if ex.options.xfwd {
            let head = ex.head();
            let proto = if head.encrypted { "https" } else { "http" };
            apply_x_forwarded(&mut ex.request.headers, &head, proto);
        }
        future::ready(Ok(Signal::Continue)).boxed()
    }
}

/// Append `x-forwarded-for/port/proto` and default `x-forwarded-host`.
pub(crate) fn apply_x_forwarded(headers: &mut HeaderMap, head: &RequestHead, proto: &str) {
    let port = inbound_port(head);
    let values = [
        ("x-forwarded-for", head.remote_addr.map(|a| a.ip().to_string()).unwrap_or_default()),
        ("x-forwarded-port", port),
        ("x-forwarded-proto", proto.to_string()),
    ];
    for (name, value) in values {
        let joined = match headers.get(name).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
            _ => value,
        };
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }

    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = head.host().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host);
        }
    }
}

/// Port the client addressed: from `Host`, else the scheme default.
fn inbound_port(head: &RequestHead) -> String {
    head.host()
        .filter(|host| !host.ends_with(']'))
        .and_then(|host| host.rsplit_once(':'))
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .unwrap_or_else(|| if head.encrypted { "443" } else { "80" }.to_string())
}

/// Relays the exchange to its destination(s).
pub struct Stream;

impl Named for Stream {
    fn name(&self) -> &str {
        "stream"
    }
}

impl WebPass for Stream {
    fn run<'a>(&'a self, ex: &'a mut WebExchange, proxy: &'a ProxyCore) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        Box::pin(stream(ex, proxy))
    }
}

async fn stream(ex: &mut WebExchange, proxy: &ProxyCore) -> Result<Signal, ProxyError> {
    let request = Arc::new(ex.head());
    let events = proxy.events().clone();
    if let Some(destination) = ex.options.primary() {
        events.emit_start(&request, destination);
    }

    let transport = proxy.transport(&ex.options);
    let inbound = Arc::new(InboundState::default());
    let inbound_body = ex.take_body().unwrap_or_else(Body::empty);
    let source = match ex.options.buffer.clone() {
        Some(buffer) => Body::from(buffer),
        None => Body::new(InboundBody::new(inbound_body, inbound.clone(), ex.idle_timeout())),
    };
    let (target_body, forward_body) = match (&ex.options.target, &ex.options.forward) {
        (Some(_), Some(_)) => {
            let (target, forward) = tee(source);
            (Some(target), Some(forward))
        }
        (Some(_), None) => (Some(source), None),
        (None, _) => (None, Some(source)),
    };

    if let (Some(forward), Some(body)) = (ex.options.forward.clone(), forward_body) {
        let outcome = Arc::new(ExchangeOutcome::new(
            Role::Forward,
            events.clone(),
            request.clone(),
            forward,
            inbound.clone(),
            ex.on_complete().cloned(),
        ));
        match setup_outgoing(&ex.options, &request, Role::Forward, false, body) {
            Ok(outgoing) => {
                tokio::spawn(mirror(transport.send(outgoing), outcome));
            }
            Err(err) => report_detached(&outcome, err),
        }
    }

    let (Some(target), Some(body)) = (ex.options.target.clone(), target_body) else {
        ex.response.end();
        return Ok(Signal::Halt);
    };

    let outcome = Arc::new(ExchangeOutcome::new(
        Role::Target,
        events.clone(),
        request.clone(),
        target,
        inbound.clone(),
        ex.on_complete().cloned(),
    ));
    let mut guard = AbandonGuard::new(outcome.clone());

    let outgoing = match setup_outgoing(&ex.options, &request, Role::Target, false, body) {
        Ok(outgoing) => outgoing,
        Err(err) => {
            guard.disarm();
            return settle_failure(&mut ex.response, &outcome, err);
        }
    };
    let (mut parts, body) = outgoing.into_parts();
    if !parts.headers.contains_key(header::EXPECT) {
        events.emit_proxy_req(&mut parts, &request, &ex.options);
    }

    let send = bounded(transport.send(Request::from_parts(parts, body)), ex.options.proxy_timeout);
    let idle = ex.idle_timeout();
    let stalled = async {
        match idle {
            Some(idle) => inbound.idle_for(idle).await,
            None => future::pending::<()>().await,
        }
    };
    let result = tokio::select! {
        biased;
        _ = inbound.destroyed() => Err(ProxyError::ClientAborted),
        _ = stalled => Err(ProxyError::ClientAborted),
        result = send => result,
    };
    guard.disarm();

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(err) => {
            let err = if inbound.is_destroyed() && !matches!(err, ProxyError::UpstreamTimeout(_)) {
                ProxyError::ClientAborted
            } else {
                err
            };
            return settle_failure(&mut ex.response, &outcome, err);
        }
    };

    relay(ex, proxy, &request, outcome, upstream);
    Ok(Signal::Halt)
}

/// Response half of the stream pass.
fn relay(
    ex: &mut WebExchange,
    proxy: &ProxyCore,
    request: &RequestHead,
    outcome: Arc<ExchangeOutcome>,
    upstream: Response<Incoming>,
) {
    let self_handle = ex.options.self_handle_response;
    let (parts, body) = upstream.into_parts();
    let head = ResponseHead {
        status: parts.status,
        version: parts.version,
        headers: parts.headers,
    };
    tracing::debug!(exchange_id = %request.id, status = %head.status, "Upstream responded");

    let relay_body = RelayBody::new(
        body,
        outcome.clone(),
        head.clone(),
        !self_handle,
        ex.options.proxy_timeout,
    );
    let mut upstream = UpstreamResponse::new(head, Body::new(relay_body));

    proxy.events().emit_proxy_res(&mut upstream, request, &mut ex.response);

    if !ex.response.headers_sent() && !self_handle {
        for pass in proxy.response_passes().iter() {
            if pass.run(request, &mut ex.response, &mut upstream, &ex.options).is_halt() {
                break;
            }
        }
    }

    if ex.response.finished() {
        outcome.end(&upstream.head);
        return;
    }
    match upstream.take_body() {
        Some(body) if !self_handle => ex.response.pipe(body),
        Some(body) => {
            tokio::spawn(drain(body));
        }
        None => {}
    }
}

/// Translate a routed failure into the client response.
pub(crate) fn settle_failure(
    response: &mut OutboundResponse,
    outcome: &ExchangeOutcome,
    err: ProxyError,
) -> Result<Signal, ProxyError> {
    let status = err.status_code();
    match outcome.fail(err) {
        Failure::Handled(Some(replacement)) => response.replace(replacement),
        Failure::Reset => {
            if !response.finished() {
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                response.end_with(status, Body::empty());
            }
        }
        Failure::Handled(None) | Failure::Settled => {
            if !response.finished() {
                response.end_with(status, Body::empty());
            }
        }
        Failure::Unhandled(err) => return Err(err),
    }
    Ok(Signal::Halt)
}

/// Route a failure nobody is waiting on; unhandled ones are logged.
pub(crate) fn report_detached(outcome: &ExchangeOutcome, err: ProxyError) {
    if let Failure::Unhandled(err) = outcome.fail(err) {
        tracing::error!(exchange_id = %outcome.request().id, error = %err, "Unhandled proxy error");
    }
}

/// Await the upstream head, giving up after `limit`. The body relay keeps
/// the same limit as an idle timeout.
pub(crate) async fn bounded<F>(send: F, limit: Option<Duration>) -> Result<Response<Incoming>, ProxyError>
where
    F: Future<Output = Result<Response<Incoming>, ProxyError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, send)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(limit))?,
        None => send.await,
    }
}

async fn mirror(
    send: BoxFuture<'static, Result<Response<Incoming>, ProxyError>>,
    outcome: Arc<ExchangeOutcome>,
) {
    match send.await {
        Ok(response) => {
            tracing::debug!(
                exchange_id = %outcome.request().id,
                status = %response.status(),
                "Forward request answered"
            );
            outcome.complete();
        }
        Err(err) => report_detached(&outcome, err),
    }
}
