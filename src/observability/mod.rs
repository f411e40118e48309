//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch, passes, error handler, listener
//!     → logging.rs (tracing events, spans keyed by exchange id)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → stdout (fmt subscriber)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::init_metrics;
