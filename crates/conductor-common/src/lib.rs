//! Shared domain types for the conductor control plane.
//!
//! These are the value types every component (store, queue, gates, worker
//! loop, HTTP layer) agrees on: opaque prefixed ids, the run phase lattice,
//! and the small enums that back status columns. Keeping them in their own
//! crate means the HTTP/queue/store layers can each depend on the same
//! definitions without a dependency cycle back into the binary crate.

pub mod ids;
pub mod phase;
pub mod status;

pub use ids::*;
pub use phase::{Phase, Step, TERMINAL_PHASES, allowed_transitions};
pub use status::*;
