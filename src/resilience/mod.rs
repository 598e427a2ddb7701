//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → circuit_breaker.rs (admission check, probe slot in Half-Open)
//!     → forward with deadline (http::forward)
//!     → outcome recorded back on the permit
//! ```
//!
//! # Design Decisions
//! - One breaker per protected target; ingress and egress never share one
//! - No retries: a failed forward is reported, not repeated
//! - Open → Half-Open is evaluated lazily, no background timer

pub mod breakers;
pub mod circuit_breaker;

pub use breakers::BreakerRegistry;
pub use circuit_breaker::{BreakerMetrics, BreakerPermit, BreakerState, CircuitBreaker};
