//! Shared primitives used across the gateway binary: RCU cells for hot-reload
//! state, Go-style duration serde, graceful shutdown/drain, build metadata
//! and the telemetry bootstrap. None of this is specific to any one
//! pipeline stage; it's the plumbing every stage sits on top of.

pub mod arc;
pub mod duration;
pub mod signal;
pub mod telemetry;
pub mod version;

pub use arc::{Atomic, AtomicOption};
