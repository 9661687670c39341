//! Response comparison subsystem.
//!
//! # Data Flow
//! ```text
//! stream leg (relayed)       compare leg (buffered)
//!         │                          │
//!         └──→ summary.rs ←──────────┘   (status, decoded size, latency)
//!                   ↓
//!             comparator.rs            (status / size / latency rules)
//!                   ↓
//!        Verdict → warn! "Response mismatch detected" | debug! "Responses match"
//! ```
//!
//! # Design Decisions
//! - Runs after the client has its response; never affects what the client sees
//! - Sizes are compared after Content-Encoding decoding
//! - Latency counts only when the compare endpoint is slower

pub mod comparator;
pub mod summary;

pub use comparator::{Comparator, Mismatch, MismatchReport, Verdict};
pub use summary::{Leg, LegTiming, ResponseSummary};
