//! Network layer.
//!
//! The owned listener is served by `axum-server`; this module only loads
//! the TLS material it terminates with.

pub mod tls;
