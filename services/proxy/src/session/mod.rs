//! Session Store.
//!
//! A [`Session`] is the unit of per-connection relay state. Each session
//! carries its own lock, so work on one session never waits on another;
//! the [`SessionStore`] is a sharded map of them.
//!
//! Invariants kept here:
//! - `response_cursor <= server_responses.len()`
//! - `handshake_complete` and `adopted` only go from false to true
//! - once adopted, no buffered response is handed out again and nothing is
//!   written to the target through the session
//! - the target connection is closed at most once (closing takes the link)

mod link;
mod store;

pub use link::{TargetLink, TargetReader};
pub use store::{SessionStore, StoreStats};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use veil_id::SessionId;
use veil_proto::ServerMessage;

/// Capacity of the wake-up queue between the target reader and a waiter.
pub const PENDING_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} already exists")]
    Exists(SessionId),

    #[error("session {0} has been handed off")]
    Adopted(SessionId),

    #[error("session {0} has no usable target connection")]
    TargetUnavailable(SessionId),
}

/// Last-activity clock shared with relay tasks working on a session's
/// behalf.
#[derive(Debug, Clone)]
pub struct Activity {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Resolved target of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
struct SessionState {
    target: Option<TargetLink>,
    target_addr: Option<TargetAddr>,
    target_closed: bool,
    client_messages: Vec<Vec<u8>>,
    server_responses: Vec<Vec<u8>>,
    response_cursor: usize,
    handshake_complete: bool,
    adopted: bool,
}

impl SessionState {
    fn drained(&self) -> bool {
        self.response_cursor == self.server_responses.len()
    }

    fn advance(&mut self) -> Option<Vec<u8>> {
        let next = self.server_responses.get(self.response_cursor)?.clone();
        self.response_cursor += 1;
        Some(next)
    }
}

/// Per-connection relay state.
pub struct Session {
    id: SessionId,
    sni: String,
    created_at: Instant,
    activity: Activity,
    state: Mutex<SessionState>,
    /// Serialises operations that move the target connection.
    transition: Mutex<()>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, sni: impl Into<String>) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(PENDING_QUEUE_CAPACITY);
        Self {
            id,
            sni: sni.into(),
            created_at: Instant::now(),
            activity: Activity::new(),
            state: Mutex::new(SessionState::default()),
            transition: Mutex::new(()),
            wake_tx,
            wake_rx: Mutex::new(wake_rx),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Host name from the ClientHello; empty when it had none.
    pub fn sni(&self) -> &str {
        &self.sni
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    fn wake(&self) {
        // A full queue already holds a pending wake-up.
        let _ = self.wake_tx.try_send(());
    }

    pub async fn append_client_message(&self, bytes: Vec<u8>) {
        self.state.lock().await.client_messages.push(bytes);
        self.activity.touch();
    }

    pub async fn append_server_response(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().await;
            if state.adopted {
                return Err(SessionError::Adopted(self.id));
            }
            state.server_responses.push(bytes);
        }
        self.activity.touch();
        self.wake();
        Ok(())
    }

    /// Hands out the next undelivered server response and advances the
    /// cursor past it.
    pub async fn advance_cursor(&self) -> Option<Vec<u8>> {
        let next = {
            let mut state = self.state.lock().await;
            if state.adopted {
                return None;
            }
            state.advance()
        };
        if next.is_some() {
            self.activity.touch();
        }
        next
    }

    /// Waits up to `wait` for the next server response.
    ///
    /// Returns an empty message with `handshake_complete` set once the
    /// handshake is complete and everything buffered has been delivered,
    /// and an empty incomplete message when the wait runs out.
    pub async fn wait_for_response(&self, wait: Duration) -> ServerMessage {
        let deadline = Instant::now() + wait;
        let mut wake = self.wake_rx.lock().await;

        loop {
            {
                let mut state = self.state.lock().await;
                if !state.adopted {
                    if let Some(data) = state.advance() {
                        self.activity.touch();
                        return ServerMessage {
                            data,
                            handshake_complete: state.handshake_complete && state.drained(),
                        };
                    }
                }
                if state.handshake_complete || state.adopted {
                    return ServerMessage {
                        data: Vec::new(),
                        handshake_complete: true,
                    };
                }
                if state.target_closed {
                    return ServerMessage::default();
                }
            }

            match tokio::time::timeout_at(deadline, wake.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) | Err(_) => return ServerMessage::default(),
            }
        }
    }

    /// Sets `handshake_complete`. Returns true on the first call only.
    pub async fn mark_complete(&self) -> bool {
        let first = {
            let mut state = self.state.lock().await;
            !std::mem::replace(&mut state.handshake_complete, true)
        };
        self.activity.touch();
        self.wake();
        first
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.handshake_complete
    }

    /// Sets `adopted` and discards every response not yet delivered.
    /// Returns how many were discarded.
    pub async fn mark_adopted(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock().await;
            state.adopted = true;
            let discarded = state.server_responses.len() - state.response_cursor;
            state.response_cursor = state.server_responses.len();
            discarded
        };
        let mut wake = self.wake_rx.lock().await;
        while wake.try_recv().is_ok() {}
        self.activity.touch();
        discarded
    }

    pub async fn is_adopted(&self) -> bool {
        self.state.lock().await.adopted
    }

    /// Takes every response not yet delivered, advancing the cursor to the
    /// end.
    pub async fn take_undelivered(&self) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().await;
        let cursor = state.response_cursor;
        state.response_cursor = state.server_responses.len();
        state.server_responses[cursor..].to_vec()
    }

    pub async fn response_cursor(&self) -> usize {
        self.state.lock().await.response_cursor
    }

    pub async fn client_messages(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.client_messages.clone()
    }

    pub async fn server_responses(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.server_responses.clone()
    }

    pub async fn set_target_addr(&self, target: TargetAddr) {
        self.state.lock().await.target_addr = Some(target);
    }

    pub async fn target_addr(&self) -> Option<TargetAddr> {
        self.state.lock().await.target_addr.clone()
    }

    /// Records that the target closed its side.
    pub async fn mark_target_closed(&self) {
        self.state.lock().await.target_closed = true;
        self.wake();
    }

    /// Installs the target link, closing any link it replaces.
    pub async fn set_target(&self, link: TargetLink) {
        let previous = self.state.lock().await.target.replace(link);
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.activity.touch();
    }

    pub async fn has_target(&self) -> bool {
        self.state.lock().await.target.is_some()
    }

    /// Writes to the attached target connection. Only the write half is
    /// locked for the duration; readers of the session carry on.
    pub async fn write_to_target(&self, bytes: &[u8], timeout: Duration) -> io::Result<()> {
        let writer = {
            let state = self.state.lock().await;
            if state.adopted {
                return Err(io::Error::other(SessionError::Adopted(self.id)));
            }
            let Some(TargetLink::Attached(target)) = state.target.as_ref() else {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    SessionError::TargetUnavailable(self.id),
                ));
            };
            Arc::clone(&target.writer)
        };

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(bytes).await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "target write timeout"));
            }
        }
        self.activity.touch();
        Ok(())
    }

    /// Stops the target reader at the next record boundary and waits until
    /// it has let go of the read half.
    pub async fn park_reader(&self) {
        let _transition = self.transition.lock().await;
        self.park_reader_locked().await;
    }

    async fn park_reader_locked(&self) {
        let running = {
            let mut state = self.state.lock().await;
            match state.target.as_mut() {
                Some(TargetLink::Attached(target)) if target.reader.is_running() => Some(
                    std::mem::replace(&mut target.reader, TargetReader::Finished),
                ),
                _ => None,
            }
        };
        let Some(running) = running else {
            return;
        };

        // The reader may need the state lock to finish its current record.
        let stopped = running.stop().await;

        let mut state = self.state.lock().await;
        if let Some(TargetLink::Attached(target)) = state.target.as_mut() {
            target.reader = stopped;
        }
    }

    /// Takes exclusive ownership of the target socket out of the session.
    pub async fn take_stream(&self) -> Result<TcpStream, SessionError> {
        let _transition = self.transition.lock().await;
        self.park_reader_locked().await;

        // Let a write already under way finish before reuniting the halves.
        let writer = match self.state.lock().await.target.as_ref() {
            Some(TargetLink::Attached(target)) => Some(Arc::clone(&target.writer)),
            _ => None,
        };
        if let Some(writer) = writer {
            drop(writer.lock().await);
        }

        let mut state = self.state.lock().await;
        match state.target.take() {
            Some(TargetLink::Attached(target)) => match target.into_stream() {
                Ok(stream) => Ok(stream),
                Err(target) => {
                    state.target = Some(TargetLink::Attached(target));
                    Err(SessionError::TargetUnavailable(self.id))
                }
            },
            other => {
                state.target = other;
                Err(SessionError::TargetUnavailable(self.id))
            }
        }
    }

    /// Closes the owned target connection, if any. Returns true when a
    /// connection was closed by this call.
    pub async fn close(&self) -> bool {
        let link = self.state.lock().await.target.take();
        match link {
            Some(link) => {
                link.close().await;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("sni", &self.sni)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn session() -> Session {
        Session::new(SessionId::new(), "example.com")
    }

    #[tokio::test]
    async fn test_responses_delivered_once_in_order() {
        let s = session();
        for i in 0..3u8 {
            s.append_server_response(vec![i]).await.unwrap();
        }
        assert_eq!(s.advance_cursor().await, Some(vec![0]));
        assert_eq!(s.wait_for_response(Duration::from_millis(10)).await.data, vec![1]);
        assert_eq!(s.advance_cursor().await, Some(vec![2]));
        assert_eq!(s.advance_cursor().await, None);
        assert_eq!(s.response_cursor().await, 3);
    }

    #[tokio::test]
    async fn test_wait_returns_when_response_arrives() {
        let s = Arc::new(session());
        let producer = Arc::clone(&s);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append_server_response(vec![0x16, 0x03]).await.unwrap();
        });

        let msg = s.wait_for_response(Duration::from_secs(5)).await;
        assert_eq!(msg.data, vec![0x16, 0x03]);
        assert!(!msg.handshake_complete);
    }

    #[tokio::test]
    async fn test_wait_times_out_empty() {
        let s = session();
        let msg = s.wait_for_response(Duration::from_millis(20)).await;
        assert!(msg.is_empty());
        assert!(!msg.handshake_complete);
    }

    #[tokio::test]
    async fn test_complete_reported_after_drain() {
        let s = session();
        s.append_server_response(vec![1]).await.unwrap();
        assert!(s.mark_complete().await);
        assert!(!s.mark_complete().await);

        let first = s.wait_for_response(Duration::from_millis(10)).await;
        assert_eq!(first.data, vec![1]);
        assert!(first.handshake_complete);

        let second = s.wait_for_response(Duration::from_millis(10)).await;
        assert!(second.is_empty());
        assert!(second.handshake_complete);
    }

    #[tokio::test]
    async fn test_adoption_discards_undelivered() {
        let s = session();
        for i in 0..4u8 {
            s.append_server_response(vec![i]).await.unwrap();
        }
        s.advance_cursor().await;

        assert_eq!(s.mark_adopted().await, 3);
        assert_eq!(s.advance_cursor().await, None);
        assert!(s.wait_for_response(Duration::from_millis(10)).await.is_empty());
        assert_eq!(
            s.append_server_response(vec![9]).await,
            Err(SessionError::Adopted(s.id()))
        );
        // History is kept for diagnostics.
        assert_eq!(s.server_responses().await.len(), 4);
    }

    #[tokio::test]
    async fn test_take_undelivered() {
        let s = session();
        for i in 0..3u8 {
            s.append_server_response(vec![i]).await.unwrap();
        }
        s.advance_cursor().await;
        assert_eq!(s.take_undelivered().await, vec![vec![1], vec![2]]);
        assert!(s.take_undelivered().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_without_target() {
        let s = session();
        let err = s.write_to_target(b"x", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(s.take_stream().await.is_err());
        assert!(!s.close().await);
    }

    #[tokio::test]
    async fn test_stalled_target_write_does_not_block_waiters() {
        use tokio::net::TcpListener;

        // The target accepts and never reads, so a large write stalls once
        // the socket buffers fill.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        let _target = accept.await.unwrap();

        let s = Arc::new(session());
        let (read, write) = stream.into_split();
        s.set_target(TargetLink::attached(addr, write, TargetReader::Parked(read)))
            .await;

        let writer = Arc::clone(&s);
        let stalled = tokio::spawn(async move {
            let bulk = vec![0u8; 64 * 1024 * 1024];
            writer.write_to_target(&bulk, Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let msg = s.wait_for_response(Duration::from_millis(50)).await;
        assert!(msg.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!s.is_adopted().await);

        let err = stalled.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(s.close().await);
    }

    #[tokio::test]
    async fn test_detached_close_signals_owner_once() {
        let s = session();
        let (link, mut rx) = TargetLink::detached("127.0.0.1:443".parse().unwrap());
        s.set_target(link).await;

        assert!(s.close().await);
        assert!(rx.try_recv().is_ok());
        assert!(!s.close().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock() {
        let s = session();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(s.idle_for() >= Duration::from_secs(30));
        s.append_client_message(vec![1]).await;
        assert!(s.idle_for() < Duration::from_secs(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push,
        Advance,
        Adopt,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![4 => Just(Op::Push), 4 => Just(Op::Advance), 1 => Just(Op::Adopt)]
    }

    proptest! {
        #[test]
        fn prop_cursor_never_passes_end(ops in proptest::collection::vec(op(), 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let s = session();
                let mut delivered = Vec::new();
                let mut pushed = 0u8;
                for op in ops {
                    match op {
                        Op::Push => {
                            if s.append_server_response(vec![pushed]).await.is_ok() {
                                pushed = pushed.wrapping_add(1);
                            }
                        }
                        Op::Advance => delivered.extend(s.advance_cursor().await),
                        Op::Adopt => { s.mark_adopted().await; }
                    }
                    assert!(s.response_cursor().await <= s.server_responses().await.len());
                }
                // Delivered responses form an in-order prefix with no repeats.
                for (i, d) in delivered.iter().enumerate() {
                    assert_eq!(d, &vec![i as u8]);
                }
            });
        }
    }
}
