//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGUSR1        → DispatchEngine::switch_roles
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → front door stops accepting, drains in-flight responses
//!             → admin listener and DNS refresher stop
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
