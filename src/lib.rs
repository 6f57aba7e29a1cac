//! Taxi backend - application wiring around the shared database handles.
//!
//! This library crate exposes configuration loading for the `taxi` binary
//! and for integration testing.

pub mod config;
