//! Shared test fixtures.
//!
//! - [`tls`]: builders for ClientHello, ServerHello, and other records, so
//!   tests never hand-count length prefixes.
//! - [`target`]: scripted TCP targets that answer a ClientHello with a fixed
//!   flight and then echo.

pub mod target;
pub mod tls;
