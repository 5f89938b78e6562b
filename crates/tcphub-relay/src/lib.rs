//! Connection relay
//!
//! The [`Relay`] consumes connections from two sources, a "hub" side and an
//! "external" side, pairs one of each and splices their byte streams
//! together until either side ends. It then waits for the next pair.
//!
//! Bytes that reach a connection while it waits alone in its slot are
//! captured right before streaming starts and delivered first, so nothing
//! sent during the pairing gap is lost.

mod pairing;
mod relay;
mod stats;

pub use pairing::{Direction, Role};
pub use relay::{Relay, RelayConfig, RelayError, RelayStream};
pub use stats::{RelayStats, RelayStatsSnapshot};
