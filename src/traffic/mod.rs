//! Traffic management subsystem.
//!
//! # Data Flow
//! ```text
//! Admin (set_policy / increment_canary / promote_canary)
//!     → manager.rs (validate, copy-on-write, atomic table swap)
//!
//! Request (service, headers, source IP)
//!     → manager.rs (load one policy snapshot)
//!     → policy.rs (active strategy by precedence)
//!     → select.rs (A/B hash, canary draw, weighted split)
//!     → version or "no constraint"
//!
//! Egress outcomes
//!     → manager.rs per-version counters
//!     → rollout.rs (automatic canary steps)
//! ```

pub mod manager;
pub mod policy;
pub mod rollout;
pub mod select;

pub use manager::{RoutingDecision, TrafficManager, VersionStats};
pub use policy::{AbTestConfig, CanaryConfig, Strategy, StrategyKind, TrafficPolicy, WeightedVersion};
pub use rollout::{CanaryProgressor, StepOutcome};
pub use select::RequestContext;
