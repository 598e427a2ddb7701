//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → health monitor, canary progressor, listeners stop
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary drains the sidecar and exits
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Drain has a deadline; stragglers are aborted after it

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
