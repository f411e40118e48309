//! Proxy instance: dispatcher, facade and lifecycle notifications.
//!
//! # Data Flow
//! ```text
//! ProxyServer::web / ws  (or the owned listener)
//!     → core.rs (merge options, resolve, run pipeline)
//!     → passes (pipeline/, http/)
//!     → events.rs (start, proxy_req, proxy_res, end, error, econnreset)
//!     → error_handler.rs (one terminal outcome per outgoing request)
//! ```

pub mod core;
pub mod error_handler;
pub mod events;
pub mod server;

pub use self::core::{CallOptions, ProxyCore};
pub use error_handler::Failure;
pub use events::{ErrorDisposition, EventHooks};
pub use server::ProxyServer;
