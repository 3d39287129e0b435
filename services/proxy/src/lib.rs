//! veil proxy library.
//!
//! The crate ships the `veil` binary; the library surface exists so the
//! integration and end-to-end tests can assemble edges and bridges in
//! process.

pub mod bridge;
pub mod config;
pub mod dialer;
pub mod edge;
pub mod handoff;
pub mod handshake;
pub mod oob;
pub mod reaper;
pub mod relay;
pub mod session;
