//! Dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! front door (http/server.rs)
//!     → context.rs (RequestContext: id, envelope, raw body, deadline)
//!     → inbound.rs (InboundConnection / PendingResponse pair)
//!     → engine.rs (DispatchEngine::handle, spawned)
//!         → roles.rs (one snapshot of stream/compare)
//!         → relay.rs (stream leg to the client)
//!         → compare leg + comparison/ (after the client is served)
//! ```
//!
//! # Design Decisions
//! - The handler waits only for the response head; dispatch outlives it
//! - Role switches apply to requests that arrive after the switch

pub mod context;
pub mod engine;
pub mod inbound;
pub mod relay;
pub mod roles;

pub use context::{ClientState, RequestContext};
pub use engine::{DispatchEngine, EngineError};
pub use inbound::{ClientWriter, InboundConnection, PendingResponse};
pub use relay::{DisconnectKind, RelayError, StreamingRelay};
pub use roles::{RoleAssignment, RoleController, RoleSwitch};
