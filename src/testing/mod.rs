//! Testing utilities and mock implementations
//!
//! In-memory transports and scripted backends for exercising the workflows
//! without an MQTT broker.

pub mod mocks;

pub use mocks::*;
