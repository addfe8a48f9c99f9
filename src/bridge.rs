//! Streaming bridge between a live connection and an archiver process
//!
//! Upload: exactly the declared number of bytes flow from the socket into the
//! encoder input, never buffering more than one read. Download: decoder
//! output flows back to the peer as block-sized data chunks.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::checksum::StreamDigest;
use crate::error::{ProtocolError, TransferError};
use crate::protocol::{DOWNLOAD_CHUNK, SERVER_READ_CHUNK};
use crate::protocol_core::write_chunk;

/// Why an upload stream stopped
#[derive(Debug)]
pub enum UploadEnd {
    /// All declared bytes arrived
    Complete,
    /// Peer closed its side before the declared count
    PeerClosed,
    ReadFailed(io::Error),
    IdleTimeout,
    /// The encoder stopped accepting input; `received` counts the rejected read
    SinkFailed(io::Error),
}

#[derive(Debug)]
pub struct Pumped {
    pub received: u64,
    pub end: UploadEnd,
}

impl Pumped {
    pub fn is_complete(&self) -> bool {
        matches!(self.end, UploadEnd::Complete)
    }
}

#[derive(Debug)]
pub struct Streamed {
    pub bytes: u64,
    pub sha256: String,
}

/// Resolves once shutdown has been requested. A dropped sender means nobody
/// can request shutdown any more, so that never resolves.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let stopped = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !stopped {
        std::future::pending::<()>().await;
    }
}

/// Move `declared` bytes from `conn` into `sink`.
///
/// Each read asks for at most the bytes still owed, so nothing past the
/// declared body is consumed. Early close, read errors, idle timeouts and a
/// failing sink end the stream short (the caller still finalises the
/// encoder); only shutdown is an error.
pub async fn pump_upload<R, W>(
    conn: &mut R,
    sink: &mut W,
    declared: u64,
    idle: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Pumped, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let cap = usize::try_from(declared)
        .unwrap_or(usize::MAX)
        .min(SERVER_READ_CHUNK);
    let mut buf = vec![0u8; cap];
    let mut received: u64 = 0;

    let end = loop {
        if received >= declared {
            break UploadEnd::Complete;
        }
        let want = (declared - received).min(buf.len() as u64) as usize;
        let read = tokio::select! {
            _ = cancelled(shutdown) => return Err(TransferError::Cancelled),
            res = timeout(idle, conn.read(&mut buf[..want])) => res,
        };
        let n = match read {
            Ok(Ok(0)) => break UploadEnd::PeerClosed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break UploadEnd::ReadFailed(e),
            Err(_) => break UploadEnd::IdleTimeout,
        };
        received += n as u64;
        let written = tokio::select! {
            _ = cancelled(shutdown) => return Err(TransferError::Cancelled),
            res = sink.write_all(&buf[..n]) => res,
        };
        if let Err(e) = written {
            break UploadEnd::SinkFailed(e);
        }
    };

    let end = match end {
        UploadEnd::SinkFailed(e) => UploadEnd::SinkFailed(e),
        other => match sink.flush().await {
            Ok(()) => other,
            Err(e) => UploadEnd::SinkFailed(e),
        },
    };
    Ok(Pumped { received, end })
}

/// Stream `source` to `conn` as data chunks of [`DOWNLOAD_CHUNK`] bytes
/// (the last may be shorter), then the zero-length terminator.
pub async fn pump_download<R, W>(
    source: &mut R,
    conn: &mut W,
    idle: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Streamed, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    let mut digest = StreamDigest::new();

    loop {
        let n = tokio::select! {
            _ = cancelled(shutdown) => return Err(TransferError::Cancelled),
            res = read_full(source, &mut buf) => res.map_err(TransferError::Source)?,
        };
        if n == 0 {
            break;
        }
        tokio::select! {
            _ = cancelled(shutdown) => return Err(TransferError::Cancelled),
            res = timed_chunk(conn, &buf[..n], idle) => res?,
        }
        digest.update(&buf[..n]);
    }

    timed_chunk(conn, &[], idle).await?;
    conn.flush().await.map_err(TransferError::Peer)?;
    Ok(Streamed {
        bytes: digest.bytes(),
        sha256: digest.finish_hex(),
    })
}

// Fill `buf` unless the source ends first; returns bytes read (0 = exhausted)
async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn timed_chunk<W>(conn: &mut W, data: &[u8], idle: Duration) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(idle, write_chunk(conn, data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(ProtocolError::Io(e))) => Err(TransferError::Peer(e)),
        Ok(Err(e)) => Err(TransferError::Peer(io::Error::new(io::ErrorKind::Other, e))),
        Err(_) => Err(TransferError::Peer(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer stopped reading",
        ))),
    }
}
