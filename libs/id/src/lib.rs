//! # veil-id
//!
//! Typed identifiers for in-flight relay sessions and the edge
//! connections that carry them.
//!
//! Session IDs use a prefixed format: `{prefix}_{ulid}`, for example
//! `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The same string travels over the
//! out-of-band control surface, so parsing is strict and round-trips.
//!
//! ULIDs are time-ordered and carry 80 bits of randomness, so an ID is
//! never reused while the process holds a reference to it.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

#[doc(hidden)]
pub use ulid::Ulid;
