//! Error taxonomy for the proxy core.
//!
//! # Design Decisions
//! - Configuration problems never reach the network
//! - Connection resets caused by a departed client are told apart from
//!   genuine upstream failures by [`ProxyError::is_connection_reset`]
//! - Every error maps to the status code the client sees when nobody
//!   supplies a replacement response

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use axum::http::StatusCode;

use crate::config::Role;

/// Boxed error used for body streams.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors raised while proxying a single exchange or running the listener.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Neither `target` nor `forward` was configured.
    #[error("must provide a proper URL as target or forward")]
    MissingDestination,

    /// A destination string could not be parsed.
    #[error("invalid {role} URL `{url}`: {source}")]
    InvalidDestination {
        role: Role,
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A destination uses a scheme the transports cannot speak.
    #[error("unsupported {role} scheme `{scheme}`")]
    UnsupportedScheme { role: Role, scheme: String },

    /// The outgoing request could not be assembled.
    #[error("failed to build outgoing request: {0}")]
    Request(#[from] axum::http::Error),

    /// The upstream connection or exchange failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    /// The upstream did not answer within `proxy_timeout`.
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    /// The client went away (or stalled past `timeout`) while the exchange was in flight.
    #[error("client aborted the request")]
    ClientAborted,

    /// A request body could not be read.
    #[error("request body error: {0}")]
    Body(#[source] BoxError),

    /// The redirect-following transport gave up.
    #[error("maximum number of redirects ({0}) exceeded")]
    TooManyRedirects(usize),

    /// A redirect pointed somewhere unusable.
    #[error("invalid redirect location `{0}`")]
    InvalidRedirect(String),

    /// Completing a protocol upgrade failed.
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),

    /// The inbound connection cannot be taken over for an upgrade.
    #[error("inbound connection is not upgradable")]
    NotUpgradable,

    /// Listener or socket level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Pipeline mutation failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ProxyError {
    /// Returns true for the reset family of failures: a peer hanging up
    /// mid-flight rather than refusing or misbehaving.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            ProxyError::ClientAborted => true,
            ProxyError::Upstream(e) => chain_has_reset(e),
            ProxyError::Body(e) => chain_has_reset(e.as_ref()),
            ProxyError::Io(e) => is_reset_kind(e.kind()),
            _ => false,
        }
    }

    /// Returns true when the exchange never got past configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProxyError::MissingDestination
                | ProxyError::InvalidDestination { .. }
                | ProxyError::UnsupportedScheme { .. }
        )
    }

    /// Status returned to the client when no handler supplies a response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_configuration() => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Pipeline(_) | ProxyError::Request(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingDestination
            | ProxyError::InvalidDestination { .. }
            | ProxyError::UnsupportedScheme { .. } => "config",
            ProxyError::Request(_) => "request",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::UpstreamTimeout(_) => "timeout",
            ProxyError::ClientAborted => "aborted",
            ProxyError::Body(_) => "body",
            ProxyError::TooManyRedirects(_) | ProxyError::InvalidRedirect(_) => "redirect",
            ProxyError::Upgrade(_) | ProxyError::NotUpgradable => "upgrade",
            ProxyError::Io(_) => "io",
            ProxyError::Pipeline(_) => "pipeline",
        }
    }
}

fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

fn chain_has_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if is_reset_kind(io.kind()) {
                return true;
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_canceled() || h.is_incomplete_message() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Errors raised by pipeline lookup and mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// No pass with the given name exists in the pipeline.
    #[error("no such pass `{0}`")]
    NoSuchPass(String),

    /// The traffic kind is neither `web` nor `ws`.
    #[error("invalid pipeline kind `{0}`, expected `web` or `ws`")]
    InvalidKind(String),

    /// A pass was offered to the pipeline of the other kind.
    #[error("a {pass} pass cannot be inserted into the {pipeline} pipeline")]
    KindMismatch {
        pipeline: &'static str,
        pass: &'static str,
    },
}
