//! Terminal outcome of one outgoing request.
//!
//! Every outgoing request (target, forward or upgrade) gets one
//! [`ExchangeOutcome`]. Whichever of `end`, `error` or `econnreset` settles
//! it first is the only one that fires.
//!
//! Failure routing:
//! 1. inbound side destroyed and the error is a reset → `econnreset`
//! 2. completion callback supplied for the call → callback
//! 3. `error` hook set → hook
//! 4. otherwise → unhandled, returned to the caller as fatal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Response;
use url::Url;

use crate::config::Role;
use crate::error::ProxyError;
use crate::http::body::InboundState;
use crate::http::exchange::{CompletionCallback, RequestHead, ResponseHead};
use crate::observability::metrics;
use crate::proxy::events::{ErrorDisposition, EventHooks};

/// How a failure was disposed of.
pub enum Failure {
    /// The client went away; `econnreset` fired.
    Reset,
    /// A callback or hook took it, optionally supplying a response.
    Handled(Option<Response<Body>>),
    /// Nobody took it.
    Unhandled(ProxyError),
    /// The exchange already had its outcome.
    Settled,
}

pub(crate) struct ExchangeOutcome {
    settled: AtomicBool,
    role: Role,
    events: Arc<EventHooks>,
    request: Arc<RequestHead>,
    destination: Url,
    inbound: Arc<InboundState>,
    on_complete: Option<CompletionCallback>,
}

impl ExchangeOutcome {
    pub(crate) fn new(
        role: Role,
        events: Arc<EventHooks>,
        request: Arc<RequestHead>,
        destination: Url,
        inbound: Arc<InboundState>,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        Self {
            settled: AtomicBool::new(false),
            role,
            events,
            request,
            destination,
            inbound,
            on_complete,
        }
    }

    /// Claim the outcome. True for the first caller only.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Route a failure.
    pub(crate) fn fail(&self, err: ProxyError) -> Failure {
        if !self.settle() {
            tracing::debug!(exchange_id = %self.request.id, error = %err, "Error after exchange settled");
            return Failure::Settled;
        }

        if self.inbound.is_destroyed() && err.is_connection_reset() {
            tracing::debug!(
                exchange_id = %self.request.id,
                role = %self.role,
                destination = %self.destination,
                "Client disconnected mid-flight"
            );
            metrics::record_client_reset();
            self.events.emit_econnreset(&err, &self.request, &self.destination);
            return Failure::Reset;
        }

        tracing::warn!(
            exchange_id = %self.request.id,
            role = %self.role,
            destination = %self.destination,
            error = %err,
            "Upstream request failed"
        );
        metrics::record_upstream_error(self.role, err.kind());

        if let Some(callback) = &self.on_complete {
            return Failure::Handled(callback(&err, &self.request, &self.destination));
        }
        match self.events.emit_error(&err, &self.request, Some(&self.destination)) {
            ErrorDisposition::Handled(response) => Failure::Handled(response),
            ErrorDisposition::Unhandled => Failure::Unhandled(err),
        }
    }

    /// The upstream body was fully relayed.
    pub(crate) fn end(&self, upstream: &ResponseHead) {
        if self.settle() {
            self.events.emit_end(&self.request, upstream);
        }
    }

    /// The client dropped the exchange before it settled.
    pub(crate) fn abandon(&self) {
        if self.is_settled() {
            return;
        }
        self.inbound.destroy();
        self.fail(ProxyError::ClientAborted);
    }

    /// Settle without a notification (forward responses, finished upgrades).
    pub(crate) fn complete(&self) {
        self.settle();
    }

    pub(crate) fn request(&self) -> &Arc<RequestHead> {
        &self.request
    }
}

/// Abandons the outcome when dropped while armed. Covers the client
/// vanishing while the stream pass is still awaiting the upstream head.
pub(crate) struct AbandonGuard {
    outcome: Option<Arc<ExchangeOutcome>>,
}

impl AbandonGuard {
    pub(crate) fn new(outcome: Arc<ExchangeOutcome>) -> Self {
        Self { outcome: Some(outcome) }
    }

    pub(crate) fn disarm(&mut self) {
        self.outcome = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            outcome.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use axum::http::{request, Request, StatusCode};
    use uuid::Uuid;

    fn head() -> Arc<RequestHead> {
        let (parts, _): (request::Parts, _) = Request::new(()).into_parts();
        Arc::new(RequestHead::from_parts(Uuid::new_v4(), &parts))
    }

    fn outcome(events: EventHooks, inbound: Arc<InboundState>, on_complete: Option<CompletionCallback>) -> ExchangeOutcome {
        ExchangeOutcome::new(
            Role::Target,
            Arc::new(events),
            head(),
            Url::parse("http://127.0.0.1:9").unwrap(),
            inbound,
            on_complete,
        )
    }

    #[test]
    fn reset_after_client_abort_goes_to_econnreset_only() {
        let errors = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let (e, r) = (errors.clone(), resets.clone());
        let events = EventHooks::new()
            .on_error(move |_, _, _| {
                e.fetch_add(1, Ordering::SeqCst);
                None
            })
            .on_econnreset(move |_, _, _| {
                r.fetch_add(1, Ordering::SeqCst);
            });

        let inbound = Arc::new(InboundState::default());
        inbound.destroy();
        let outcome = outcome(events, inbound, None);

        assert!(matches!(outcome.fail(ProxyError::ClientAborted), Failure::Reset));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_callback_preempts_error_hook() {
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let events = EventHooks::new().on_error(move |_, _, _| {
            e.fetch_add(1, Ordering::SeqCst);
            None
        });
        let callback: CompletionCallback = Arc::new(|_: &ProxyError, _: &RequestHead, _: &Url| {
            Some(Response::builder().status(StatusCode::IM_A_TEAPOT).body(Body::empty()).unwrap())
        });

        let outcome = outcome(events, Arc::new(InboundState::default()), Some(callback));
        match outcome.fail(ProxyError::UpstreamTimeout(std::time::Duration::from_millis(1))) {
            Failure::Handled(Some(response)) => assert_eq!(response.status(), StatusCode::IM_A_TEAPOT),
            _ => panic!("callback should have handled the failure"),
        }
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_listener_is_unhandled() {
        let outcome = outcome(EventHooks::new(), Arc::new(InboundState::default()), None);
        assert!(matches!(
            outcome.fail(ProxyError::MissingDestination),
            Failure::Unhandled(ProxyError::MissingDestination)
        ));
    }

    #[test]
    fn only_the_first_outcome_fires() {
        let ends = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let (n, e) = (ends.clone(), errors.clone());
        let events = EventHooks::new()
            .on_end(move |_, _| {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_, _, _| {
                e.fetch_add(1, Ordering::SeqCst);
                None
            });
        let outcome = outcome(events, Arc::new(InboundState::default()), None);
        let upstream = ResponseHead {
            status: StatusCode::OK,
            version: axum::http::Version::HTTP_11,
            headers: Default::default(),
        };

        outcome.end(&upstream);
        outcome.end(&upstream);
        assert!(matches!(outcome.fail(ProxyError::ClientAborted), Failure::Settled));
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }
}
