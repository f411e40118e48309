//! The dispatcher.
//!
//! # Responsibilities
//! - Merge call-site options over the instance defaults and resolve them
//! - Reject unusable configurations before any connection is made
//! - Run the pipeline of the requested kind until a pass halts
//!
//! # Design Decisions
//! - Defaults sit in an `ArcSwap` so a reload never disturbs exchanges in flight
//! - Passes get `&ProxyCore`, which is how they reach hooks and transports

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use tracing::Instrument;
use url::Url;
use uuid::Uuid;

use crate::config::{ProxyOptions, ResolvedOptions};
use crate::error::ProxyError;
use crate::http::exchange::{CompletionCallback, RequestHead, WebExchange, WsExchange};
use crate::http::transport::{self, HttpTransport, Transport};
use crate::http::{web_incoming, web_outgoing, websocket};
use crate::observability::metrics;
use crate::pipeline::{Named, PassRegistry, Pipeline, ResponsePassRef};
use crate::proxy::events::{ErrorDisposition, EventHooks};

/// Per-call extras: upgrade head bytes, option overrides and a completion callback.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub head: Option<Bytes>,
    pub overrides: Option<ProxyOptions>,
    pub on_complete: Option<CompletionCallback>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes already read past the upgrade request head.
    pub fn head(mut self, head: impl Into<Bytes>) -> Self {
        self.head = Some(head.into());
        self
    }

    /// Options that win over the instance defaults for this call.
    pub fn overrides(mut self, overrides: ProxyOptions) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Receive this call's failures instead of the `error` hook.
    pub fn on_complete(
        mut self,
        f: impl Fn(&ProxyError, &RequestHead, &Url) -> Option<Response<Body>> + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

/// Shared state behind a [`ProxyServer`](crate::proxy::ProxyServer).
pub struct ProxyCore {
    defaults: ArcSwap<ProxyOptions>,
    passes: PassRegistry,
    events: Arc<EventHooks>,
    http: HttpTransport,
}

impl ProxyCore {
    pub fn new(defaults: ProxyOptions, events: EventHooks) -> Self {
        Self {
            defaults: ArcSwap::from_pointee(defaults),
            passes: PassRegistry::new(
                Pipeline::from_passes(web_incoming::default_passes()),
                Pipeline::from_passes(websocket::default_passes()),
                Pipeline::from_passes(web_outgoing::default_passes()),
            ),
            events: Arc::new(events),
            http: HttpTransport::new(),
        }
    }

    pub fn defaults(&self) -> Arc<ProxyOptions> {
        self.defaults.load_full()
    }

    /// Swap the instance defaults. Exchanges already dispatched keep theirs.
    pub fn set_defaults(&self, defaults: ProxyOptions) {
        self.defaults.store(Arc::new(defaults));
    }

    pub fn events(&self) -> &Arc<EventHooks> {
        &self.events
    }

    pub fn passes(&self) -> &PassRegistry {
        &self.passes
    }

    pub fn response_passes(&self) -> Arc<Pipeline<ResponsePassRef>> {
        self.passes.response()
    }

    /// The plain per-scheme transport.
    pub fn http(&self) -> &HttpTransport {
        &self.http
    }

    /// The transport for one exchange, honouring `follow_redirects`.
    pub fn transport(&self, options: &ResolvedOptions) -> Arc<dyn Transport> {
        transport::select(&self.http, options.follow_redirects, options.max_redirects)
    }

    fn resolve(&self, overrides: Option<&ProxyOptions>) -> Result<ResolvedOptions, ProxyError> {
        let defaults = self.defaults.load();
        match overrides {
            Some(overrides) => defaults.merged(overrides).resolve(),
            None => defaults.resolve(),
        }
    }

    /// Run a plain HTTP exchange through the web pipeline.
    pub async fn dispatch_web(&self, request: Request<Body>, call: CallOptions) -> Result<Response<Body>, ProxyError> {
        let id = Uuid::new_v4();
        let span = tracing::debug_span!("exchange", exchange_id = %id, kind = "web");
        async move {
            let started = Instant::now();
            tracing::debug!(method = %request.method(), uri = %request.uri(), "Dispatching");

            let options = match self.resolve(call.overrides.as_ref()) {
                Ok(options) => options,
                Err(err) => return self.reject("web", id, &request, err, started),
            };

            let mut exchange = WebExchange::new(id, request, options, call.on_complete);
            for pass in self.passes.web().iter() {
                tracing::trace!(pass = pass.name(), "Running pass");
                let signal = pass.run(&mut exchange, self).await.inspect_err(|err| {
                    metrics::record_exchange("web", err.status_code().as_u16(), started);
                })?;
                if signal.is_halt() {
                    break;
                }
            }

            let response = exchange.response.into_response();
            metrics::record_exchange("web", response.status().as_u16(), started);
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Run an upgrade exchange through the ws pipeline.
    pub async fn dispatch_ws(&self, request: Request<Body>, call: CallOptions) -> Result<Response<Body>, ProxyError> {
        let id = Uuid::new_v4();
        let span = tracing::debug_span!("exchange", exchange_id = %id, kind = "ws");
        async move {
            let started = Instant::now();
            tracing::debug!(uri = %request.uri(), "Dispatching upgrade");

            let options = match self.resolve(call.overrides.as_ref()) {
                Ok(options) => options,
                Err(err) => return self.reject("ws", id, &request, err, started),
            };

            let mut exchange = WsExchange::new(id, request, options, call.head, call.on_complete);
            for pass in self.passes.ws().iter() {
                tracing::trace!(pass = pass.name(), "Running pass");
                let signal = pass.run(&mut exchange, self).await.inspect_err(|err| {
                    metrics::record_exchange("ws", err.status_code().as_u16(), started);
                })?;
                if signal.is_halt() {
                    break;
                }
            }

            let response = exchange.response.into_response();
            metrics::record_exchange("ws", response.status().as_u16(), started);
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Configuration errors go to the `error` hook; nothing reaches the network.
    fn reject(
        &self,
        kind: &'static str,
        id: Uuid,
        request: &Request<Body>,
        err: ProxyError,
        started: Instant,
    ) -> Result<Response<Body>, ProxyError> {
        tracing::warn!(error = %err, "Rejected exchange");
        let (parts, _) = clone_head(request).into_parts();
        let head = RequestHead::from_parts(id, &parts);
        let status = err.status_code();
        metrics::record_exchange(kind, status.as_u16(), started);

        match self.events.emit_error(&err, &head, None) {
            ErrorDisposition::Handled(Some(response)) => Ok(response),
            ErrorDisposition::Handled(None) => Ok(status_response(status)),
            ErrorDisposition::Unhandled => Err(err),
        }
    }
}

/// Head-only copy of a request, keeping the extensions hooks look at.
fn clone_head(request: &Request<Body>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = request.uri().clone();
    *head.version_mut() = request.version();
    *head.headers_mut() = request.headers().clone();
    if let Some(info) = request.extensions().get::<axum::extract::ConnectInfo<std::net::SocketAddr>>() {
        head.extensions_mut().insert(*info);
    }
    if let Some(marker) = request.extensions().get::<crate::http::exchange::Encrypted>() {
        head.extensions_mut().insert(*marker);
    }
    head
}

pub(crate) fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
