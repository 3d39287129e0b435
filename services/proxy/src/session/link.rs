//! Ownership of a session's live target connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// The read side of an attached target connection.
pub enum TargetReader {
    /// A reader task owns the read half and hands it back when stopped.
    Running {
        stop: oneshot::Sender<()>,
        task: JoinHandle<Option<OwnedReadHalf>>,
    },
    /// Stopped between records; the read half is idle.
    Parked(OwnedReadHalf),
    /// The target closed its side, or the reader failed.
    Finished,
}

impl TargetReader {
    pub fn running(stop: oneshot::Sender<()>, task: JoinHandle<Option<OwnedReadHalf>>) -> Self {
        Self::Running { stop, task }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Stops a running reader and waits for it to give back the read half.
    pub(crate) async fn stop(self) -> Self {
        match self {
            Self::Running { stop, task } => {
                let _ = stop.send(());
                match task.await {
                    Ok(Some(read)) => Self::Parked(read),
                    Ok(None) => Self::Finished,
                    Err(e) => {
                        debug!(error = %e, "Target reader task failed");
                        Self::Finished
                    }
                }
            }
            other => other,
        }
    }
}

/// Write half of an attached target. Writers lock it on their own, so a
/// stalled target never holds up the rest of the session.
pub(crate) type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// A target connection whose halves are held by the session.
pub struct AttachedTarget {
    pub(crate) peer: SocketAddr,
    pub(crate) writer: SharedWriter,
    pub(crate) reader: TargetReader,
}

impl AttachedTarget {
    /// Rebuilds the socket. Only possible once the reader is parked and no
    /// write is in flight.
    pub(crate) fn into_stream(self) -> Result<TcpStream, Self> {
        let Self {
            peer,
            writer,
            reader,
        } = self;
        let TargetReader::Parked(read) = reader else {
            return Err(Self {
                peer,
                writer,
                reader,
            });
        };
        let write = match Arc::try_unwrap(writer) {
            Ok(write) => write.into_inner(),
            Err(writer) => {
                return Err(Self {
                    peer,
                    writer,
                    reader: TargetReader::Parked(read),
                })
            }
        };
        read.reunite(write).map_err(|e| Self {
            peer,
            writer: Arc::new(Mutex::new(e.1)),
            reader: TargetReader::Parked(e.0),
        })
    }
}

/// A target connection owned by a relay task elsewhere. The session keeps
/// only the means to stop it.
pub struct DetachedTarget {
    pub(crate) peer: SocketAddr,
    pub(crate) shutdown: oneshot::Sender<()>,
}

/// Who holds a session's connection to its target.
pub enum TargetLink {
    Attached(AttachedTarget),
    Detached(DetachedTarget),
}

impl TargetLink {
    pub fn attached(peer: SocketAddr, writer: OwnedWriteHalf, reader: TargetReader) -> Self {
        Self::Attached(AttachedTarget {
            peer,
            writer: Arc::new(Mutex::new(writer)),
            reader,
        })
    }

    /// A detached link plus the receiver the owning relay task listens on.
    pub fn detached(peer: SocketAddr) -> (Self, oneshot::Receiver<()>) {
        let (shutdown, rx) = oneshot::channel();
        (Self::Detached(DetachedTarget { peer, shutdown }), rx)
    }

    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Attached(a) => a.peer,
            Self::Detached(d) => d.peer,
        }
    }

    /// Closes the connection. Consumes the link so this happens once.
    pub async fn close(self) {
        match self {
            Self::Attached(attached) => {
                if let TargetReader::Running { stop, task } = attached.reader {
                    let _ = stop.send(());
                    task.abort();
                }
                // A write still in flight drops its half when it ends.
                if let Ok(mut writer) = attached.writer.try_lock() {
                    let _ = writer.shutdown().await;
                }
            }
            Self::Detached(detached) => {
                let _ = detached.shutdown.send(());
            }
        }
    }
}

impl fmt::Debug for TargetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attached(a) => f
                .debug_struct("Attached")
                .field("peer", &a.peer)
                .field("reader_running", &a.reader.is_running())
                .finish(),
            Self::Detached(d) => f.debug_struct("Detached").field("peer", &d.peer).finish(),
        }
    }
}
