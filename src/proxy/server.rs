//! The user-facing proxy object.
//!
//! # Responsibilities
//! - Own the pipelines and hooks of one proxy instance
//! - Expose `web`/`ws` entry points for hosts that run their own server
//! - Optionally own an HTTP or HTTPS listener (`listen`/`close`)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    Router,
};
use axum_server::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ProxyOptions;
use crate::error::{PipelineError, ProxyError};
use crate::http::exchange::Encrypted;
use crate::http::websocket::is_websocket_upgrade;
use crate::net::tls::load_tls_config;
use crate::pipeline::{Kind, Pass, ResponsePassRef};
use crate::proxy::core::{status_response, CallOptions, ProxyCore};
use crate::proxy::events::EventHooks;

struct OwnedListener {
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
}

/// A proxy instance. Cheap to clone; clones share pipelines, hooks and listener.
#[derive(Clone)]
pub struct ProxyServer {
    core: Arc<ProxyCore>,
    listener: Arc<Mutex<Option<OwnedListener>>>,
}

impl ProxyServer {
    /// A proxy with `options` as instance defaults and no hooks.
    pub fn new(options: ProxyOptions) -> Self {
        Self::with_events(options, EventHooks::default())
    }

    pub fn with_events(options: ProxyOptions, events: EventHooks) -> Self {
        Self {
            core: Arc::new(ProxyCore::new(options, events)),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// Current instance defaults.
    pub fn options(&self) -> Arc<ProxyOptions> {
        self.core.defaults()
    }

    /// Replace the instance defaults.
    pub fn set_options(&self, options: ProxyOptions) {
        self.core.set_defaults(options);
    }

    /// Proxy a plain HTTP request.
    ///
    /// Returns `Err` only for failures nobody handled: no completion
    /// callback was given and no `error` hook is set.
    pub async fn web(&self, request: Request<Body>, call: CallOptions) -> Result<Response<Body>, ProxyError> {
        self.core.dispatch_web(request, call).await
    }

    /// Proxy a WebSocket upgrade request. The request must still carry
    /// hyper's upgrade extension for the connection to be spliced.
    pub async fn ws(&self, request: Request<Body>, call: CallOptions) -> Result<Response<Body>, ProxyError> {
        self.core.dispatch_ws(request, call).await
    }

    /// Splice `pass` in front of the pass called `name` in the `kind` pipeline.
    pub fn before(&self, kind: &str, name: &str, pass: impl Into<Pass>) -> Result<(), PipelineError> {
        let kind: Kind = kind.parse()?;
        self.core.passes().insert_before(kind, name, pass.into())
    }

    /// Splice `pass` right behind the pass called `name` in the `kind` pipeline.
    pub fn after(&self, kind: &str, name: &str, pass: impl Into<Pass>) -> Result<(), PipelineError> {
        let kind: Kind = kind.parse()?;
        self.core.passes().insert_after(kind, name, pass.into())
    }

    pub fn before_response(&self, name: &str, pass: ResponsePassRef) -> Result<(), PipelineError> {
        self.core.passes().insert_response_before(name, pass)
    }

    pub fn after_response(&self, name: &str, pass: ResponsePassRef) -> Result<(), PipelineError> {
        self.core.passes().insert_response_after(name, pass)
    }

    pub fn web_pass_names(&self) -> Vec<String> {
        self.core.passes().web().names()
    }

    pub fn ws_pass_names(&self) -> Vec<String> {
        self.core.passes().ws().names()
    }

    pub fn response_pass_names(&self) -> Vec<String> {
        self.core.passes().response().names()
    }

    /// Bind `addr` and serve every request through this proxy. Terminates
    /// TLS when the defaults carry `ssl`. Upgrades go to the ws pipeline
    /// when `ws` is enabled.
    pub async fn listen(&self, addr: SocketAddr) -> Result<&Self, ProxyError> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "proxy is already listening",
            )));
        }

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let tls = self.core.defaults().ssl.clone();
        let encrypted = tls.is_some();
        let state = ListenerState {
            core: self.core.clone(),
            encrypted,
        };
        let app = Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = Handle::new();
        let task = match tls {
            Some(tls) => {
                let config = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
                let server = axum_server::tls_rustls::from_tcp_rustls(std_listener, config).handle(handle.clone());
                tokio::spawn(async move { server.serve(app).await })
            }
            None => {
                let server = axum_server::from_tcp(std_listener).handle(handle.clone());
                tokio::spawn(async move { server.serve(app).await })
            }
        };

        tracing::info!(address = %local_addr, encrypted, "Proxy listening");
        *slot = Some(OwnedListener {
            handle,
            task,
            local_addr,
        });
        Ok(self)
    }

    /// Address of the owned listener, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Stop the owned listener and wait until its connections have drained.
    /// Calling it again, or without a listener, returns immediately.
    pub async fn close(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        tracing::info!(address = %listener.local_addr, "Closing proxy listener");
        listener.handle.graceful_shutdown(None);
        match listener.task.await {
            Ok(Ok(())) => tracing::info!(address = %listener.local_addr, "Proxy listener closed"),
            Ok(Err(e)) => tracing::warn!(address = %listener.local_addr, error = %e, "Proxy listener failed"),
            Err(e) => tracing::warn!(address = %listener.local_addr, error = %e, "Proxy listener task panicked"),
        }
    }
}

#[derive(Clone)]
struct ListenerState {
    core: Arc<ProxyCore>,
    encrypted: bool,
}

async fn proxy_handler(State(state): State<ListenerState>, mut request: Request<Body>) -> Response<Body> {
    if state.encrypted {
        request.extensions_mut().insert(Encrypted);
    }
    let upgrade = state.core.defaults().ws.unwrap_or(false)
        && is_websocket_upgrade(request.method(), request.headers());

    let result = if upgrade {
        state.core.dispatch_ws(request, CallOptions::default()).await
    } else {
        state.core.dispatch_web(request, CallOptions::default()).await
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, kind = err.kind(), "Unhandled proxy error");
            status_response(err.status_code())
        }
    }
}
