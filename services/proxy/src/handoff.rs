//! Connection Handoff.
//!
//! Once the handshake is complete the edge needs a raw byte stream that
//! reaches the target. Strategies are tried in the configured order and the
//! first one that produces a stream wins:
//!
//! - `direct`: a fresh connection from the edge to the target's address,
//!   only when the target negotiated TLS 1.3
//! - `takeover`: the bridge's own target socket, with undelivered
//!   handshake responses discarded
//! - `relay`: a tunnel through the bridge, which writes undelivered
//!   responses first and then copies bytes both ways

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use veil_id::SessionId;

use crate::dialer::{DialError, TargetDialer};
use crate::oob::{BoxedStream, OobChannel, OobError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Direct,
    Takeover,
    Relay,
}

pub const DEFAULT_ORDER: [Strategy; 3] = [Strategy::Direct, Strategy::Takeover, Strategy::Relay];

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Takeover => "takeover",
            Strategy::Relay => "relay",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Strategy::Direct),
            "takeover" => Ok(Strategy::Takeover),
            "relay" => Ok(Strategy::Relay),
            other => Err(format!(
                "unknown handoff strategy '{other}' (expected direct, takeover, or relay)"
            )),
        }
    }
}

/// Parses a comma-separated preference list. Duplicates are rejected.
pub fn parse_strategies(spec: &str) -> Result<Vec<Strategy>, String> {
    let mut order = Vec::new();
    for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
        let strategy: Strategy = part.parse()?;
        if order.contains(&strategy) {
            return Err(format!("handoff strategy '{strategy}' listed twice"));
        }
        order.push(strategy);
    }
    if order.is_empty() {
        return Err("handoff strategy list is empty".to_string());
    }
    Ok(order)
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("skipped: {0}")]
    Skipped(String),

    #[error(transparent)]
    Oob(#[from] OobError),

    #[error(transparent)]
    Dial(#[from] DialError),
}

pub struct Handoff<'a> {
    oob: &'a dyn OobChannel,
    dialer: &'a TargetDialer,
    order: &'a [Strategy],
}

impl<'a> Handoff<'a> {
    pub fn new(oob: &'a dyn OobChannel, dialer: &'a TargetDialer, order: &'a [Strategy]) -> Self {
        Self { oob, dialer, order }
    }

    /// Walks the strategies in order. `None` means every one failed.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn acquire(&self, id: SessionId) -> Option<(Strategy, BoxedStream)> {
        for &strategy in self.order {
            match self.attempt(id, strategy).await {
                Ok(stream) => {
                    info!(strategy = %strategy, "Handoff established");
                    return Some((strategy, stream));
                }
                Err(AttemptError::Skipped(reason)) => {
                    debug!(strategy = %strategy, reason = %reason, "Handoff strategy skipped");
                }
                Err(e) => {
                    warn!(strategy = %strategy, error = %e, "Handoff strategy failed");
                }
            }
        }
        None
    }

    async fn attempt(&self, id: SessionId, strategy: Strategy) -> Result<BoxedStream, AttemptError> {
        match strategy {
            Strategy::Direct => {
                let info = self.oob.target_info(id).await?;
                if info.tls_version != "1.3" {
                    return Err(AttemptError::Skipped(format!(
                        "target negotiated TLS '{}'",
                        info.tls_version
                    )));
                }
                let Some(addr) = info.socket_addr() else {
                    return Err(AttemptError::Skipped(format!(
                        "unusable target address '{}'",
                        info.target_ip
                    )));
                };
                let stream = self.dialer.connect_addr(addr).await?;
                Ok(Box::new(stream))
            }
            Strategy::Takeover => Ok(self.oob.adopt_connection(id).await?),
            Strategy::Relay => Ok(self.oob.open_tunnel(id).await?),
        }
    }
}
