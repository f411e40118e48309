//! Lifecycle notifications.
//!
//! One optional hook per event. Hooks run inline on the task driving the
//! exchange, so they should be quick.
//!
//! | event        | fired when                                               |
//! |--------------|----------------------------------------------------------|
//! | `start`      | the stream pass begins                                   |
//! | `proxy_req`  | the outgoing request is built (not with `Expect`)        |
//! | `proxy_req_ws` | the outgoing upgrade request is built                  |
//! | `proxy_res`  | the upstream response head arrives                       |
//! | `end`        | the upstream body has been fully relayed                 |
//! | `error`      | an exchange fails and no completion callback was given   |
//! | `econnreset` | the failure was the client going away                    |
//! | `open`/`close` | an upgraded connection is spliced / torn down          |

use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{request, Response};
use url::Url;

use crate::config::ResolvedOptions;
use crate::error::ProxyError;
use crate::http::exchange::{OutboundResponse, RequestHead, ResponseHead, UpstreamResponse};

pub type StartHook = Arc<dyn Fn(&RequestHead, &Url) + Send + Sync>;
pub type ProxyReqHook = Arc<dyn Fn(&mut request::Parts, &RequestHead, &ResolvedOptions) + Send + Sync>;
pub type ProxyResHook = Arc<dyn Fn(&mut UpstreamResponse, &RequestHead, &mut OutboundResponse) + Send + Sync>;
pub type EndHook = Arc<dyn Fn(&RequestHead, &ResponseHead) + Send + Sync>;
pub type ErrorHook =
    Arc<dyn Fn(&ProxyError, &RequestHead, Option<&Url>) -> Option<Response<Body>> + Send + Sync>;
pub type ResetHook = Arc<dyn Fn(&ProxyError, &RequestHead, &Url) + Send + Sync>;
pub type SocketHook = Arc<dyn Fn(&RequestHead) + Send + Sync>;

/// What happened to an error offered to the `error` hook.
pub enum ErrorDisposition {
    /// A hook took it, optionally supplying the response to send.
    Handled(Option<Response<Body>>),
    /// Nobody is listening; the error is fatal.
    Unhandled,
}

/// Event hooks of one proxy instance.
#[derive(Clone, Default)]
pub struct EventHooks {
    start: Option<StartHook>,
    proxy_req: Option<ProxyReqHook>,
    proxy_req_ws: Option<ProxyReqHook>,
    proxy_res: Option<ProxyResHook>,
    end: Option<EndHook>,
    error: Option<ErrorHook>,
    econnreset: Option<ResetHook>,
    open: Option<SocketHook>,
    close: Option<SocketHook>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(&RequestHead, &Url) + Send + Sync + 'static) -> Self {
        self.start = Some(Arc::new(f));
        self
    }

    /// Last chance to edit the outgoing request head.
    pub fn on_proxy_req(
        mut self,
        f: impl Fn(&mut request::Parts, &RequestHead, &ResolvedOptions) + Send + Sync + 'static,
    ) -> Self {
        self.proxy_req = Some(Arc::new(f));
        self
    }

    pub fn on_proxy_req_ws(
        mut self,
        f: impl Fn(&mut request::Parts, &RequestHead, &ResolvedOptions) + Send + Sync + 'static,
    ) -> Self {
        self.proxy_req_ws = Some(Arc::new(f));
        self
    }

    /// Sees the upstream response before the rewrite chain. With
    /// `self_handle_response` this hook owns building the client response.
    pub fn on_proxy_res(
        mut self,
        f: impl Fn(&mut UpstreamResponse, &RequestHead, &mut OutboundResponse) + Send + Sync + 'static,
    ) -> Self {
        self.proxy_res = Some(Arc::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(&RequestHead, &ResponseHead) + Send + Sync + 'static) -> Self {
        self.end = Some(Arc::new(f));
        self
    }

    /// Handle exchange failures. The returned response, if any, is sent to the client.
    pub fn on_error(
        mut self,
        f: impl Fn(&ProxyError, &RequestHead, Option<&Url>) -> Option<Response<Body>> + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_econnreset(mut self, f: impl Fn(&ProxyError, &RequestHead, &Url) + Send + Sync + 'static) -> Self {
        self.econnreset = Some(Arc::new(f));
        self
    }

    pub fn on_open(mut self, f: impl Fn(&RequestHead) + Send + Sync + 'static) -> Self {
        self.open = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&RequestHead) + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn has_error_listener(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn emit_start(&self, request: &RequestHead, destination: &Url) {
        if let Some(hook) = &self.start {
            hook(request, destination);
        }
    }

    pub(crate) fn emit_proxy_req(&self, outgoing: &mut request::Parts, request: &RequestHead, options: &ResolvedOptions) {
        if let Some(hook) = &self.proxy_req {
            hook(outgoing, request, options);
        }
    }

    pub(crate) fn emit_proxy_req_ws(&self, outgoing: &mut request::Parts, request: &RequestHead, options: &ResolvedOptions) {
        if let Some(hook) = &self.proxy_req_ws {
            hook(outgoing, request, options);
        }
    }

    pub(crate) fn emit_proxy_res(
        &self,
        upstream: &mut UpstreamResponse,
        request: &RequestHead,
        response: &mut OutboundResponse,
    ) {
        if let Some(hook) = &self.proxy_res {
            hook(upstream, request, response);
        }
    }

    pub(crate) fn emit_end(&self, request: &RequestHead, upstream: &ResponseHead) {
        if let Some(hook) = &self.end {
            hook(request, upstream);
        }
    }

    pub(crate) fn emit_error(&self, err: &ProxyError, request: &RequestHead, destination: Option<&Url>) -> ErrorDisposition {
        match &self.error {
            Some(hook) => ErrorDisposition::Handled(hook(err, request, destination)),
            None => ErrorDisposition::Unhandled,
        }
    }

    pub(crate) fn emit_econnreset(&self, err: &ProxyError, request: &RequestHead, destination: &Url) {
        if let Some(hook) = &self.econnreset {
            hook(err, request, destination);
        }
    }

    pub(crate) fn emit_open(&self, request: &RequestHead) {
        if let Some(hook) = &self.open {
            hook(request);
        }
    }

    pub(crate) fn emit_close(&self, request: &RequestHead) {
        if let Some(hook) = &self.close {
            hook(request);
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("start", &self.start.is_some())
            .field("proxy_req", &self.proxy_req.is_some())
            .field("proxy_req_ws", &self.proxy_req_ws.is_some())
            .field("proxy_res", &self.proxy_res.is_some())
            .field("end", &self.end.is_some())
            .field("error", &self.error.is_some())
            .field("econnreset", &self.econnreset.is_some())
            .field("open", &self.open.is_some())
            .field("close", &self.close.is_some())
            .finish()
    }
}
