//! Body plumbing between the inbound and outgoing sides.
//!
//! # Responsibilities
//! - Track whether the inbound side has been destroyed (error, stall, hang-up)
//! - Track inbound activity for the inbound idle timeout
//! - Tee one body into two when both target and forward are configured
//! - Signal `end` once the upstream body has been fully relayed
//! - Enforce the outbound idle timeout while relaying the upstream body
//!
//! Bodies are streamed frame by frame; nothing is buffered beyond the tee's
//! small channels, so backpressure flows through in both directions.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures_util::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Sleep};

use crate::error::{BoxError, ProxyError};
use crate::http::exchange::ResponseHead;
use crate::proxy::error_handler::{ExchangeOutcome, Failure};

/// Frames buffered per tee branch before the slower side applies backpressure.
const TEE_DEPTH: usize = 8;

/// Liveness of the inbound connection as observed through its body.
#[derive(Debug)]
pub struct InboundState {
    destroyed: AtomicBool,
    notify: Notify,
    opened: Instant,
    /// Milliseconds after `opened` of the last inbound frame.
    last_active: AtomicU64,
}

impl Default for InboundState {
    fn default() -> Self {
        Self {
            destroyed: AtomicBool::new(false),
            notify: Notify::new(),
            opened: Instant::now(),
            last_active: AtomicU64::new(0),
        }
    }
}

impl InboundState {
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Resolves once the inbound side is destroyed.
    pub async fn destroyed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_destroyed() {
                return;
            }
            notified.await;
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_active.store(elapsed, Ordering::Release);
    }

    fn last_active(&self) -> Instant {
        self.opened + Duration::from_millis(self.last_active.load(Ordering::Acquire))
    }

    /// Resolves once the inbound side has gone `idle` without activity, and
    /// destroys it.
    pub async fn idle_for(&self, idle: Duration) {
        loop {
            tokio::time::sleep_until(self.last_active() + idle).await;
            if self.last_active() + idle <= Instant::now() {
                self.destroy();
                return;
            }
        }
    }
}

/// The inbound request body as fed to the outgoing request.
///
/// A read error or an idle stall marks the inbound side destroyed so the
/// stream pass can abort the outgoing request.
pub struct InboundBody {
    inner: Body,
    state: Arc<InboundState>,
    idle: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl InboundBody {
    pub fn new(inner: Body, state: Arc<InboundState>, idle: Option<Duration>) -> Self {
        Self {
            inner,
            state,
            idle,
            sleep: idle.map(|d| Box::pin(tokio::time::sleep(d))),
            done: false,
        }
    }

    fn fail(&mut self, err: BoxError) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.done = true;
        self.state.destroy();
        Poll::Ready(Some(Err(err)))
    }
}

impl HttpBody for InboundBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.state.touch();
                if let (Some(sleep), Some(idle)) = (this.sleep.as_mut(), this.idle) {
                    sleep.as_mut().reset(Instant::now() + idle);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => this.fail(Box::new(e)),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                let stalled = this
                    .sleep
                    .as_mut()
                    .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready());
                if stalled {
                    let err = io::Error::new(io::ErrorKind::ConnectionAborted, "inbound body idle timeout");
                    return this.fail(Box::new(err));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

type FrameResult = Result<Frame<Bytes>, BoxError>;

/// Split one body into two that each see every frame.
///
/// A branch whose receiver is dropped stops being fed; the other keeps going.
pub fn tee(body: Body) -> (Body, Body) {
    let (primary_tx, primary_rx) = mpsc::channel::<FrameResult>(TEE_DEPTH);
    let (mirror_tx, mirror_rx) = mpsc::channel::<FrameResult>(TEE_DEPTH);

    tokio::spawn(async move {
        let mut body = body;
        let mut primary = Some(primary_tx);
        let mut mirror = Some(mirror_tx);

        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(copy) = copy_frame(&frame) {
                        feed(&mut mirror, Ok(copy)).await;
                    }
                    feed(&mut primary, Ok(frame)).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    feed(&mut primary, Err(Box::new(e))).await;
                    let err = io::Error::new(io::ErrorKind::ConnectionAborted, message);
                    feed(&mut mirror, Err(Box::new(err))).await;
                    break;
                }
            }
            if primary.is_none() && mirror.is_none() {
                break;
            }
        }
    });

    (channel_body(primary_rx), channel_body(mirror_rx))
}

async fn feed(slot: &mut Option<mpsc::Sender<FrameResult>>, item: FrameResult) {
    if let Some(tx) = slot {
        if tx.send(item).await.is_err() {
            *slot = None;
        }
    }
}

fn copy_frame(frame: &Frame<Bytes>) -> Option<Frame<Bytes>> {
    if let Some(data) = frame.data_ref() {
        Some(Frame::data(data.clone()))
    } else {
        frame.trailers_ref().map(|trailers| Frame::trailers(trailers.clone()))
    }
}

fn channel_body(rx: mpsc::Receiver<FrameResult>) -> Body {
    let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    Body::new(StreamBody::new(frames))
}

/// The upstream response body on its way to the client.
///
/// Settles the exchange with `end` once the upstream body is exhausted. When
/// piped to the client, being dropped early means the client went away. A
/// stall longer than the outbound idle timeout fails the exchange with
/// [`ProxyError::UpstreamTimeout`] and cuts the body short.
pub(crate) struct RelayBody {
    inner: Incoming,
    outcome: Arc<ExchangeOutcome>,
    upstream: ResponseHead,
    piped: bool,
    ended: bool,
    done: bool,
    idle: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl RelayBody {
    pub(crate) fn new(
        inner: Incoming,
        outcome: Arc<ExchangeOutcome>,
        upstream: ResponseHead,
        piped: bool,
        idle: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            outcome,
            upstream,
            piped,
            ended: false,
            done: false,
            idle,
            sleep: idle.map(|d| Box::pin(tokio::time::sleep(d))),
        }
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.outcome.end(&self.upstream);
        }
    }

    fn report(&mut self, err: ProxyError) {
        self.ended = true;
        self.done = true;
        if let Failure::Unhandled(err) = self.outcome.fail(err) {
            tracing::error!(exchange_id = %self.outcome.request().id, error = %err, "Unhandled proxy error");
        }
    }
}

impl HttpBody for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.done = true;
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(sleep), Some(idle)) = (this.sleep.as_mut(), this.idle) {
                    sleep.as_mut().reset(Instant::now() + idle);
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.report(ProxyError::Body(Box::new(io::Error::other(e.to_string()))));
                Poll::Ready(Some(Err(Box::new(e))))
            }
            Poll::Pending => {
                let stalled = this
                    .sleep
                    .as_mut()
                    .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready());
                match this.idle {
                    Some(idle) if stalled => {
                        let err = ProxyError::UpstreamTimeout(idle);
                        let cut = io::Error::new(io::ErrorKind::TimedOut, err.to_string());
                        this.report(err);
                        Poll::Ready(Some(Err(Box::new(cut))))
                    }
                    _ => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if self.inner.is_end_stream() {
            self.finish();
        } else if self.piped {
            self.outcome.abandon();
        } else {
            // Taken by a self-handling hook and dropped unread.
            self.outcome.complete();
        }
    }
}

/// Read a body to the end, discarding it.
pub(crate) async fn drain(mut body: Body) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tee_delivers_every_frame_to_both_sides() {
        let (a, b) = tee(Body::from("mirror me"));
        let a = a.collect().await.unwrap().to_bytes();
        let b = b.collect().await.unwrap().to_bytes();
        assert_eq!(a, Bytes::from_static(b"mirror me"));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn tee_keeps_feeding_when_one_side_is_dropped() {
        let (a, b) = tee(Body::from("only one reader"));
        drop(b);
        let a = a.collect().await.unwrap().to_bytes();
        assert_eq!(a, Bytes::from_static(b"only one reader"));
    }

    #[tokio::test]
    async fn stalled_body_destroys_inbound() {
        let (_tx, rx) = mpsc::channel::<FrameResult>(1);
        let state = Arc::new(InboundState::default());
        let body = InboundBody::new(channel_body(rx), state.clone(), Some(Duration::from_millis(20)));

        let result = Body::new(body).collect().await;
        assert!(result.is_err());
        assert!(state.is_destroyed());
    }

    #[tokio::test]
    async fn idle_inbound_is_destroyed_after_last_activity() {
        let state = Arc::new(InboundState::default());
        tokio::time::sleep(Duration::from_millis(30)).await;
        state.touch();

        let started = Instant::now();
        state.idle_for(Duration::from_millis(40)).await;
        assert!(state.is_destroyed());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn destroyed_wakes_waiters() {
        let state = Arc::new(InboundState::default());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.destroyed().await })
        };
        tokio::task::yield_now().await;
        state.destroy();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
