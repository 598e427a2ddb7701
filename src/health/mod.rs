//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (monitor.rs):
//!     Periodic timer
//!     → Probe each instance (HTTP GET or TCP connect)
//!     → state.rs decides on a transition
//!     → ServiceRegistry::report_health swaps in the new record
//!
//! Heartbeats:
//!     Passing probe or explicit heartbeat refreshes last_heartbeat
//!     → instances silent past the TTL are evicted
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Probe failures never reach request callers
//! - The monitor holds a weak registry handle and exits when it is dropped

pub mod monitor;
pub mod state;

pub use monitor::HealthMonitor;
pub use state::HealthTracker;
