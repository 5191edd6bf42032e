//! Room relay and client-side negotiation coordinator for small WebRTC mesh calls.
//!
//! The relay ([`relay`]) only tracks room membership and forwards named
//! events. Everything stateful about a call lives on the client: the
//! [`peer`] module owns one connection per remote participant and sequences
//! offer/answer exchange for it, and [`session`] reacts to room events and
//! keeps the observable call state.

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;

pub use error::{Error, Result};
