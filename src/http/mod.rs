//! HTTP forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → exchange.rs (per-exchange state)
//!     → web_incoming.rs (plain pipeline passes)  |  websocket.rs (upgrade passes)
//!     → outgoing.rs (build the outgoing request)
//!     → transport.rs (plain or redirect-following client)
//!     → web_outgoing.rs (response rewrite chain)
//!     → body.rs (inbound relay, tee, upstream relay)
//!     → client
//! ```

pub mod body;
pub mod exchange;
pub mod outgoing;
pub mod transport;
pub mod web_incoming;
pub mod web_outgoing;
pub mod websocket;

pub use exchange::{Encrypted, OutboundResponse, RequestHead, ResponseHead, UpstreamResponse, WebExchange, WsExchange};
