//! Test doubles for the clock, the radio, the broker and the ambient sinks
//!
//! Compiled into the library so integration tests under `tests/` can drive
//! both managers without hardware or a broker.

pub mod mocks;

pub use mocks::*;
