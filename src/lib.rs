//! Reverse-proxy core built around a pass pipeline.
//!
//! Every request runs through an ordered list of named passes. The last
//! default pass streams the request to a `target` (and optionally mirrors it
//! to a `forward` destination), runs the response rewrite chain on the
//! upstream head and relays the body back. Callers splice their own passes
//! in with [`ProxyServer::before`] and [`ProxyServer::after`].

pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod proxy;

pub use config::{ProxyConfig, ProxyOptions, ResolvedOptions};
pub use error::{PipelineError, ProxyError};
pub use pipeline::{response_pass, web_pass, ws_pass, Kind, Signal};
pub use proxy::{CallOptions, EventHooks, ProxyServer};
