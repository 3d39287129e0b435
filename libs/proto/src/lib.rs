//! Wire types for the veil out-of-band control surface.
//!
//! The edge and the bridge exchange JSON bodies over HTTP. Raw TLS bytes are
//! carried base64-encoded. Two endpoints (`adopt` and `tunnel`) switch the
//! control connection to a raw byte stream through an HTTP/1.1 upgrade
//! negotiated with [`UPGRADE_PROTOCOL`].

mod bytes;
mod error;
mod messages;
mod problem;
pub mod routes;

pub use error::ProtoError;
pub use messages::{
    ClientMessageRequest, ClientMessageResponse, InitiateHandshakeRequest, NextServerMessageQuery,
    ServerMessage, SessionCreated, TargetInfo,
};
pub use problem::{problem_codes, ProblemDetails, PROBLEM_CONTENT_TYPE};

/// Token for the `Upgrade` header on raw-stream endpoints.
pub const UPGRADE_PROTOCOL: &str = "veil-raw";

/// Checks that a peer agreed to switch to [`UPGRADE_PROTOCOL`].
pub fn check_upgrade(offered: Option<&str>) -> Result<(), ProtoError> {
    match offered {
        Some(p) if p.eq_ignore_ascii_case(UPGRADE_PROTOCOL) => Ok(()),
        other => Err(ProtoError::UpgradeMismatch {
            expected: UPGRADE_PROTOCOL,
            actual: other.unwrap_or("").to_string(),
        }),
    }
}
