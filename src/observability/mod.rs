//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → tracing.rs (request spans with timing)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → sidecar /metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all subsystems
//! - Metric updates go through the `metrics` facade and are cheap when no
//!   recorder is installed
//! - Request spans are opt-in per sidecar

pub mod logging;
pub mod metrics;
pub mod tracing;
