//! Connection primitives shared by the hub's producers and its relay
//!
//! - [`ManagedConnection`]: a socket tied to a cancelable lifecycle scope
//! - [`TryReadNow`]: the non-blocking probe read used before a pairing starts
//! - [`Backoff`]: jittered exponential backoff for outbound dialing

pub mod backoff;
pub mod connection;
pub mod probe;

pub use backoff::{Backoff, BackoffConfig};
pub use connection::{ConnectionEnd, ManagedConnection};
pub use probe::{probe_read, ProbeOutcome, TryReadNow};
