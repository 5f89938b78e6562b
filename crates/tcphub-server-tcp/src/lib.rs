//! Inbound side of the hub
//!
//! A [`Listener`] accepts TCP connections on one address and hands every one
//! of them to its receiver, without waiting for earlier ones to finish.

mod server;

pub use server::{Listener, ListenerConfig, ListenerError};
