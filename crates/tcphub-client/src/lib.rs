//! Outbound side of the hub
//!
//! The [`Dialer`] keeps exactly one connection to a fixed address alive,
//! redialing with backoff whenever the previous one ends or a dial fails.

mod dialer;

pub use dialer::{Dialer, DialerConfig, DialerError};
