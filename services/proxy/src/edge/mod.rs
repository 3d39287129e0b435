//! Client-facing boundary.
//!
//! Accepts client connections, works out what they opened with, and runs
//! TLS connections through the handshake relay, the handoff chain and
//! finally the relay engine. Connections the OOB channel cannot serve are
//! connected to their target directly, without concealment.

mod listener;
mod passthrough;
mod preamble;

pub use listener::{EdgeConfig, EdgeListener, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use preamble::{
    read_preamble, Preamble, PreambleConfig, PreambleError, DEFAULT_MAX_HEAD_BYTES,
    DEFAULT_SNIFF_TIMEOUT,
};

use std::io;

use thiserror::Error;

use crate::dialer::DialError;
use crate::handshake::HandshakeError;
use crate::oob::OobError;
use crate::session::SessionError;

/// Why an edge connection ended early.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Preamble(#[from] PreambleError),

    #[error("neither SNI nor CONNECT names a target")]
    NoTarget,

    #[error(transparent)]
    Oob(#[from] OobError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("every handoff strategy failed")]
    HandoffExhausted,

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
