//! Pass contracts.
//!
//! A pass is one named step of a pipeline. Request passes are async because
//! the stream pass talks to the network; response passes only touch headers
//! and stay synchronous.

use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};

use crate::config::ResolvedOptions;
use crate::error::ProxyError;
use crate::http::exchange::{OutboundResponse, RequestHead, UpstreamResponse, WebExchange, WsExchange};
use crate::pipeline::registry::Named;
use crate::proxy::ProxyCore;

/// What the dispatcher does after a pass returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Run the next pass.
    Continue,
    /// Stop; later passes do not run.
    Halt,
}

impl Signal {
    pub fn is_halt(self) -> bool {
        matches!(self, Signal::Halt)
    }
}

/// A step of the plain HTTP pipeline.
///
/// Returning `Err` is an unhandled fatal failure: dispatch stops and the
/// error propagates to the caller of `web`.
pub trait WebPass: Named + Send + Sync {
    fn run<'a>(
        &'a self,
        exchange: &'a mut WebExchange,
        proxy: &'a ProxyCore,
    ) -> BoxFuture<'a, Result<Signal, ProxyError>>;
}

/// A step of the upgrade pipeline.
pub trait WsPass: Named + Send + Sync {
    fn run<'a>(
        &'a self,
        exchange: &'a mut WsExchange,
        proxy: &'a ProxyCore,
    ) -> BoxFuture<'a, Result<Signal, ProxyError>>;
}

/// A step of the response rewrite chain, run once the upstream head arrives.
pub trait ResponsePass: Named + Send + Sync {
    fn run(
        &self,
        request: &RequestHead,
        response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        options: &ResolvedOptions,
    ) -> Signal;
}

pub type WebPassRef = Arc<dyn WebPass>;
pub type WsPassRef = Arc<dyn WsPass>;
pub type ResponsePassRef = Arc<dyn ResponsePass>;

/// A synchronous pass built from a closure.
///
/// The closure's argument list decides which pipeline it fits:
/// `Fn(&mut WebExchange) -> Signal` for web, `Fn(&mut WsExchange) -> Signal`
/// for ws, and the four-argument form for the response chain.
pub struct FnPass<F> {
    name: String,
    f: F,
}

impl<F> FnPass<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Named for FnPass<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> WebPass for FnPass<F>
where
    F: Fn(&mut WebExchange) -> Signal + Send + Sync,
{
    fn run<'a>(
        &'a self,
        exchange: &'a mut WebExchange,
        _proxy: &'a ProxyCore,
    ) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        future::ready(Ok((self.f)(exchange))).boxed()
    }
}

impl<F> WsPass for FnPass<F>
where
    F: Fn(&mut WsExchange) -> Signal + Send + Sync,
{
    fn run<'a>(
        &'a self,
        exchange: &'a mut WsExchange,
        _proxy: &'a ProxyCore,
    ) -> BoxFuture<'a, Result<Signal, ProxyError>> {
        future::ready(Ok((self.f)(exchange))).boxed()
    }
}

impl<F> ResponsePass for FnPass<F>
where
    F: Fn(&RequestHead, &mut OutboundResponse, &mut UpstreamResponse, &ResolvedOptions) -> Signal + Send + Sync,
{
    fn run(
        &self,
        request: &RequestHead,
        response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        options: &ResolvedOptions,
    ) -> Signal {
        (self.f)(request, response, upstream, options)
    }
}

/// Wrap a closure as a web pass.
pub fn web_pass<F>(name: impl Into<String>, f: F) -> WebPassRef
where
    F: Fn(&mut WebExchange) -> Signal + Send + Sync + 'static,
{
    Arc::new(FnPass::new(name, f))
}

/// Wrap a closure as a ws pass.
pub fn ws_pass<F>(name: impl Into<String>, f: F) -> WsPassRef
where
    F: Fn(&mut WsExchange) -> Signal + Send + Sync + 'static,
{
    Arc::new(FnPass::new(name, f))
}

/// Wrap a closure as a response pass.
pub fn response_pass<F>(name: impl Into<String>, f: F) -> ResponsePassRef
where
    F: Fn(&RequestHead, &mut OutboundResponse, &mut UpstreamResponse, &ResolvedOptions) -> Signal
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnPass::new(name, f))
}
