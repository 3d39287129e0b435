use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::ConnectionError;
use crate::dialer::TargetDialer;
use crate::relay::{Relay, RelayConfig, RelayStats};
use crate::session::{Session, TargetLink};

/// Connects to `host` from the edge itself and relays `client` to it, with
/// `prefix` written to the target first. Nothing is concealed.
///
/// The session records the target and holds a detached link, so the reaper
/// can end the relay.
pub(crate) async fn relay_direct<C>(
    session: &Session,
    mut client: C,
    dialer: &TargetDialer,
    host: &str,
    port: Option<u16>,
    prefix: &[u8],
    config: &RelayConfig,
) -> Result<RelayStats, ConnectionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut target, addr) = match dialer.dial(host, port).await {
        Ok(dialed) => dialed,
        Err(e) => {
            let _ = client.shutdown().await;
            return Err(e.into());
        }
    };
    debug!(target_host = %addr.host, target_addr = %addr.addr, "Connected to target directly");

    if !prefix.is_empty() {
        target.write_all(prefix).await?;
    }

    let (link, shutdown) = TargetLink::detached(addr.addr);
    session.set_target_addr(addr).await;
    session.set_target(link).await;

    let stats = Relay::new(config.clone())
        .label("direct")
        .activity(session.activity().clone())
        .shutdown(shutdown)
        .run(client, target)
        .await?;
    Ok(stats)
}
