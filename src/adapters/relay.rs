//! Byte relay between a client and its backend.
//!
//! Each direction reads into its own buffer and writes it out completely
//! before reading again, so a slow peer throttles the other side. When one
//! direction reaches end of stream or fails, it shuts down its write side and
//! the other direction stops reading. Bytes it already read are still
//! delivered, bounded by [`DRAIN_TIMEOUT`], before both connections go away.
use std::{io, pin::pin, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time::timeout,
};

use crate::metrics;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// How long the surviving direction may take to flush what it already read.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which peer ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    Client,
    Backend,
}

/// Outcome of one relayed connection.
#[derive(Debug)]
pub struct RelayStats {
    /// Bytes written client → backend.
    pub upstream: u64,
    /// Bytes written backend → client.
    pub downstream: u64,
    pub closed_by: RelaySide,
    /// I/O error that ended the relay, if it did not end with a clean EOF.
    pub error: Option<io::Error>,
}

/// Pipe bytes both ways until one side closes, then close the other.
pub async fn relay<C, B>(client: C, backend: B) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut upstream = 0u64;
    let mut downstream = 0u64;

    let (closed_by, error) = {
        let mut to_backend = pin!(pump(
            &mut client_read,
            &mut backend_write,
            &mut upstream,
            stop_rx.clone(),
        ));
        let mut to_client = pin!(pump(
            &mut backend_read,
            &mut client_write,
            &mut downstream,
            stop_rx,
        ));

        let (closed_by, result) = tokio::select! {
            result = &mut to_backend => (RelaySide::Client, result),
            result = &mut to_client => (RelaySide::Backend, result),
        };
        stop_tx.send_replace(true);

        let drained = match closed_by {
            RelaySide::Client => timeout(DRAIN_TIMEOUT, &mut to_client).await,
            RelaySide::Backend => timeout(DRAIN_TIMEOUT, &mut to_backend).await,
        };
        let error = match drained {
            Ok(survivor) => result.err().or(survivor.err()),
            Err(_) => {
                tracing::debug!(?closed_by, "Relay drain timed out, dropping pending bytes");
                result.err()
            }
        };
        (closed_by, error)
    };

    metrics::add_relay_bytes("upstream", upstream);
    metrics::add_relay_bytes("downstream", downstream);

    RelayStats {
        upstream,
        downstream,
        closed_by,
        error,
    }
}

/// Copy `reader` into `writer` until EOF, an error, or `stop` is raised
/// between two reads. `writer` is shut down in every case.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        let mut pending = &buf[..n];
        while !pending.is_empty() {
            let written = writer.write(pending).await?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            *total += written as u64;
            pending = &pending[written..];
        }
    }
    writer.shutdown().await
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
