//! Testing utilities and mock implementations
//!
//! Mocks for the bridge's collaborators so the whole delivery path can be
//! tested without an MQTT broker or a network link.

pub mod mocks;

pub use mocks::*;
