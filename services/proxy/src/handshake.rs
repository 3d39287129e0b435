//! Handshake Relay Protocol, edge side.
//!
//! After `initiate_handshake` has shipped the ClientHello, the driver
//! forwards the first server response straight away, then runs two loops
//! until completion: one polls the OOB channel for server responses and
//! writes them to the client, the other reads client records and forwards
//! them. Whichever loop observes completion first ends both.
//!
//! The handshake deadline is a completion signal like any other: both loops
//! see it and stop at a message boundary, so client bytes already read are
//! always forwarded before the driver returns.
//!
//! Completion is inferred from client records only. A TLS 1.3 server's
//! flight after the ServerHello is all Application Data records, so the
//! record-type test would fire on the server side before the client has
//! sent its Finished.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, trace};
use veil_tls::{any_record, classify, is_handshake_complete};

use crate::oob::{OobChannel, OobError};
use crate::relay::{complete_record, RelayConfig};
use crate::session::Session;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_FIRST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(250);
pub const DEFAULT_EMPTY_POLL_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Overall bound on the relaying phase. Running out is treated as
    /// completion.
    pub timeout: Duration,
    /// Wait for the first server response (the ServerHello).
    pub first_response_timeout: Duration,
    /// Long-poll wait passed to `next_server_message`.
    pub poll_wait: Duration,
    /// Consecutive empty polls treated as completion.
    pub empty_poll_limit: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            first_response_timeout: DEFAULT_FIRST_RESPONSE_TIMEOUT,
            poll_wait: DEFAULT_POLL_WAIT,
            empty_poll_limit: DEFAULT_EMPTY_POLL_LIMIT,
        }
    }
}

/// How completion was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The OOB channel reported `handshake_complete`.
    Signalled,
    /// A forwarded client record matched the completion heuristic.
    ClientFinished,
    /// Consecutive polls came back empty.
    EmptyPolls,
    /// The handshake timeout ran out.
    Timeout,
}

impl Completion {
    /// True when completion was inferred rather than observed.
    pub fn is_assumed(&self) -> bool {
        matches!(self, Completion::EmptyPolls | Completion::Timeout)
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Completion::Signalled => "signalled",
            Completion::ClientFinished => "client_finished",
            Completion::EmptyPolls => "empty_polls",
            Completion::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("client closed the connection mid-handshake")]
    ClientClosed,

    #[error("client connection failed: {0}")]
    Client(#[source] io::Error),

    #[error("no server response within {0:?}")]
    NoServerResponse(Duration),

    #[error(transparent)]
    Oob(#[from] OobError),
}

impl HandshakeError {
    /// Failures that move the connection on to the handoff fallbacks
    /// instead of ending it.
    pub fn falls_back(&self) -> bool {
        match self {
            HandshakeError::Oob(e) => e.is_fallback_trigger(),
            HandshakeError::NoServerResponse(_) => true,
            HandshakeError::ClientClosed | HandshakeError::Client(_) => false,
        }
    }
}

type Done = watch::Sender<Option<Completion>>;

/// The first caller to report completion wins.
fn finish(done: &Done, how: Completion) {
    done.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(how);
            true
        } else {
            false
        }
    });
}

pub struct HandshakeDriver<'a> {
    oob: &'a dyn OobChannel,
    session: &'a Session,
    config: &'a HandshakeConfig,
    relay: &'a RelayConfig,
}

impl<'a> HandshakeDriver<'a> {
    pub fn new(
        oob: &'a dyn OobChannel,
        session: &'a Session,
        config: &'a HandshakeConfig,
        relay: &'a RelayConfig,
    ) -> Self {
        Self {
            oob,
            session,
            config,
            relay,
        }
    }

    /// Relays the handshake between `client` and the OOB channel until it
    /// completes. Every forwarded message is also recorded on the session.
    #[instrument(skip_all, fields(session_id = %self.session.id()))]
    pub async fn run<C>(&self, client: &mut C) -> Result<Completion, HandshakeError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.session.id();
        let deadline = Instant::now() + self.config.timeout;
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let first = self
            .oob
            .next_server_message(id, self.config.first_response_timeout)
            .await?;
        if first.is_empty() && !first.handshake_complete {
            return Err(HandshakeError::NoServerResponse(
                self.config.first_response_timeout,
            ));
        }
        let signalled = first.handshake_complete;
        self.forward_to_client(&mut client_write, first.data).await?;
        if signalled {
            return Ok(Completion::Signalled);
        }

        let (done, _) = watch::channel(None);
        let loops = async {
            tokio::try_join!(
                self.server_loop(&mut client_write, &done),
                self.client_loop(&mut client_read, &done),
            )
        };

        tokio::pin!(loops);

        let result = tokio::select! {
            result = &mut loops => result,
            _ = tokio::time::sleep_until(deadline) => {
                finish(&done, Completion::Timeout);
                loops.await
            }
        };
        result?;
        let completion = done.borrow().unwrap_or(Completion::Signalled);

        if completion.is_assumed() {
            info!(completion = %completion, "No explicit completion signal; assuming handshake complete");
        } else {
            debug!(completion = %completion, "Handshake complete");
        }
        Ok(completion)
    }

    async fn server_loop<W>(&self, client: &mut W, done: &Done) -> Result<(), HandshakeError>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.session.id();
        let mut empty_polls = 0;
        loop {
            if *done.borrow() == Some(Completion::Timeout) {
                return Ok(());
            }
            // Not cancelled: a polled message has already left the channel.
            let msg = self
                .oob
                .next_server_message(id, self.config.poll_wait)
                .await?;
            let complete = msg.handshake_complete;

            if msg.is_empty() {
                if complete {
                    finish(done, Completion::Signalled);
                    return Ok(());
                }
                if done.borrow().is_some() {
                    return Ok(());
                }
                empty_polls += 1;
                trace!(empty_polls, "Empty poll");
                if empty_polls >= self.config.empty_poll_limit {
                    finish(done, Completion::EmptyPolls);
                    return Ok(());
                }
                continue;
            }

            empty_polls = 0;
            self.forward_to_client(client, msg.data).await?;
            if complete {
                finish(done, Completion::Signalled);
                return Ok(());
            }
        }
    }

    async fn client_loop<R>(&self, client: &mut R, done: &Done) -> Result<(), HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let id = self.session.id();
        let mut done_rx = done.subscribe();
        let mut buf = vec![0u8; self.relay.buffer_size];
        loop {
            if done_rx.borrow_and_update().is_some() {
                return Ok(());
            }

            // A plain read loses nothing when the other loop finishes first.
            let n = tokio::select! {
                biased;
                _ = done_rx.changed() => return Ok(()),
                n = client.read(&mut buf[..]) => n.map_err(HandshakeError::Client)?,
            };
            if n == 0 {
                return Err(HandshakeError::ClientClosed);
            }
            let n = complete_record(client, &mut buf, n, self.relay)
                .await
                .map_err(HandshakeError::Client)?;

            let data = &buf[..n];
            trace!(kind = %classify(data), bytes = n, "Client handshake message");
            self.session.append_client_message(data.to_vec()).await;

            let signalled = self.oob.send_client_message(id, data).await?;
            if signalled || any_record(data, is_handshake_complete) {
                finish(done, Completion::ClientFinished);
                return Ok(());
            }
        }
    }

    async fn forward_to_client<W>(&self, client: &mut W, data: Vec<u8>) -> Result<(), HandshakeError>
    where
        W: AsyncWrite + Unpin,
    {
        trace!(kind = %classify(&data), bytes = data.len(), "Server handshake message");
        let write = async {
            client.write_all(&data).await?;
            client.flush().await
        };
        match timeout(self.relay.write_timeout, write).await {
            Ok(result) => result.map_err(HandshakeError::Client)?,
            Err(_) => {
                return Err(HandshakeError::Client(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "client write timeout",
                )))
            }
        }

        // The edge's copy is history only; the cursor follows what was sent.
        if self.session.append_server_response(data).await.is_ok() {
            self.session.advance_cursor().await;
        }
        Ok(())
    }
}
