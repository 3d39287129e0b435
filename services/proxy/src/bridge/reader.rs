//! Per-session target reader.
//!
//! Reads the target connection one whole TLS record at a time and appends
//! each record to the session's server responses. A stop request is only
//! honoured before the first byte of a record, so the read half is always
//! handed back on a record boundary.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;
use tracing::{debug, trace, Instrument};
use veil_tls::{classify, parse_record_header, ContentType, RECORD_HEADER_LEN};

use crate::session::{Session, TargetReader};

/// Upper bound on one chunk of non-TLS target bytes.
const OPAQUE_CHUNK: usize = 16 * 1024;

pub(crate) fn spawn(session: Arc<Session>, read: OwnedReadHalf) -> TargetReader {
    let (stop_tx, stop_rx) = oneshot::channel();
    let span = tracing::debug_span!("target_reader", session_id = %session.id());
    let task = tokio::spawn(read_target(session, read, stop_rx).instrument(span));
    TargetReader::running(stop_tx, task)
}

async fn read_target(
    session: Arc<Session>,
    mut read: OwnedReadHalf,
    mut stop: oneshot::Receiver<()>,
) -> Option<OwnedReadHalf> {
    loop {
        let mut first = [0u8; 1];
        let n = tokio::select! {
            biased;
            _ = &mut stop => {
                trace!("Target reader parked");
                return Some(read);
            }
            n = read.read(&mut first) => n,
        };

        let record = match n {
            Ok(0) => {
                debug!("Target closed connection");
                session.mark_target_closed().await;
                return None;
            }
            Ok(_) => match read_rest(&mut read, first[0]).await {
                Ok(record) => record,
                Err(e) => {
                    debug!(error = %e, "Target read failed mid-record");
                    session.mark_target_closed().await;
                    return None;
                }
            },
            Err(e) => {
                debug!(error = %e, "Target read failed");
                session.mark_target_closed().await;
                return None;
            }
        };

        trace!(kind = %classify(&record), bytes = record.len(), "Target response");
        if session.append_server_response(record).await.is_err() {
            return Some(read);
        }
    }
}

async fn read_rest(read: &mut OwnedReadHalf, first: u8) -> io::Result<Vec<u8>> {
    if ContentType::from_u8(first).is_none() {
        let mut chunk = vec![0u8; OPAQUE_CHUNK];
        chunk[0] = first;
        let n = match read.try_read(&mut chunk[1..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };
        chunk.truncate(1 + n);
        return Ok(chunk);
    }

    let mut record = vec![0u8; RECORD_HEADER_LEN];
    record[0] = first;
    read.read_exact(&mut record[1..]).await?;
    let header = parse_record_header(&record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !header.looks_like_tls() {
        return Ok(record);
    }

    record.resize(header.record_len(), 0);
    read.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
    Ok(record)
}
