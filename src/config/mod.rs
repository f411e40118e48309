//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig { listener, proxy: ProxyOptions, observability }
//!
//! Per call:
//!     instance ProxyOptions ⊕ call-site ProxyOptions   (options.rs, call site wins)
//!     → resolve() → ResolvedOptions (parsed URLs, defaults applied)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → new instance defaults swapped in atomically
//! ```
//!
//! # Design Decisions
//! - Destinations are normalized once, at the dispatch boundary
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod options;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use options::{CookieRewrite, Destination, ProxyOptions, ResolvedOptions, Role};
pub use schema::{ListenerConfig, ObservabilityConfig, ProxyConfig, TlsConfig};
