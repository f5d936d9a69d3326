//! Inter-process (Unix socket) relay sessions.
//!
//! Bytes are forwarded exactly as read; a copy of each chunk goes through a
//! per-direction [`FrameStream`] so complete frames can be reported.

use anyhow::Context;
use bytes::Bytes;
use std::{ops::RangeInclusive, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UnixStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::IpcConfig,
    context::ProxyContext,
    discovery::{DiscoveryError, discover},
    event::TransportKind,
    frame::FrameStream,
    session::{QUEUE_CAPACITY, Session, Side},
};

pub const BUFFER_SIZE: usize = 8192;

/// Where the real IPC endpoint is looked for.
#[derive(Debug, Clone)]
pub struct IpcUpstream {
    pub config: IpcConfig,
    pub slots: RangeInclusive<u16>,
    pub connect_timeout: Duration,
}

impl IpcUpstream {
    fn socket_path(&self, slot: u16) -> PathBuf {
        self.config.socket_path(slot)
    }
}

async fn dial_upstream(target: &IpcUpstream) -> Result<(UnixStream, u16), DiscoveryError> {
    discover(target.slots.clone(), |slot| {
        let path = target.socket_path(slot);
        let connect_timeout = target.connect_timeout;
        async move {
            let stream = timeout(connect_timeout, UnixStream::connect(&path))
                .await
                .with_context(|| format!("Timed out connecting to {}", path.display()))?
                .with_context(|| format!("Failed to connect to {}", path.display()))?;
            Ok::<_, anyhow::Error>((stream, slot))
        }
    })
    .await
}

#[tracing::instrument(skip_all)]
pub async fn handle_connection(
    stream: UnixStream,
    ctx: Arc<ProxyContext>,
    upstream: Arc<IpcUpstream>,
) {
    let session = Session::accept(&ctx, TransportKind::InterProcess);
    let (client_reader, client_writer) = stream.into_split();
    relay(client_reader, client_writer, &session, &ctx, &upstream).await;
}

/// Relays one accepted IPC connection until both directions have ended.
///
/// Once the upstream is connected, either side ending closes the whole
/// session: bytes already queued for the upstream are still written, then
/// both connections are dropped. If no upstream is found the client
/// connection stays open and its bytes are discarded after being logged.
async fn relay<R, W>(
    client_reader: R,
    mut client_writer: W,
    session: &Session,
    ctx: &ProxyContext,
    target: &IpcUpstream,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (to_upstream, mut upstream_queue) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
    let client_writer = &mut client_writer;
    let downstream_done = CancellationToken::new();
    let upstream_done = CancellationToken::new();

    let client_to_upstream = async {
        let mut chunks = ChunkReader::new(client_reader, Side::Downstream, ctx);
        loop {
            let chunk = tokio::select! {
                biased;
                () = upstream_done.cancelled() => break,
                chunk = chunks.next(session) => chunk,
            };
            let Some(chunk) = chunk else { break };
            // Dropped silently when there is no upstream to deliver to.
            let _ = to_upstream.send(chunk).await;
        }
        drop(to_upstream);
        session.side_closed(Side::Downstream);
        downstream_done.cancel();
    };

    let upstream_side = async {
        session.upstream_pending();
        let (stream, slot) = match dial_upstream(target).await {
            Ok(dialed) => dialed,
            Err(e) => {
                session.upstream_failed(&e);
                return;
            }
        };
        info!(id = session.id(), slot, "Connected to upstream endpoint");
        session.upstream_connected();

        let (upstream_reader, mut upstream_writer) = stream.into_split();
        let upstream_writes = async move {
            while let Some(chunk) = upstream_queue.recv().await {
                if let Err(e) = upstream_writer.write_all(&chunk).await {
                    warn!(id = session.id(), error = %e, "Failed to write to upstream");
                    break;
                }
            }
        };
        let upstream_to_client = async {
            let mut chunks = ChunkReader::new(upstream_reader, Side::Upstream, ctx);
            loop {
                let chunk = tokio::select! {
                    biased;
                    () = downstream_done.cancelled() => break,
                    chunk = chunks.next(session) => chunk,
                };
                let Some(chunk) = chunk else { break };
                if let Err(e) = client_writer.write_all(&chunk).await {
                    warn!(id = session.id(), error = %e, "Failed to write to client");
                    break;
                }
            }
            session.side_closed(Side::Upstream);
            upstream_done.cancel();
            let _ = client_writer.shutdown().await;
        };
        // Both halves drop here, closing the upstream connection.
        tokio::join!(upstream_writes, upstream_to_client);
    };

    tokio::join!(client_to_upstream, upstream_side);
}

/// Reads one direction chunk by chunk, reporting frames as they complete.
struct ChunkReader<R> {
    reader: R,
    side: Side,
    decoder: FrameStream,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    fn new(reader: R, side: Side, ctx: &ProxyContext) -> Self {
        Self {
            reader,
            side,
            decoder: FrameStream::new(ctx.max_frame_len, ctx.encoding),
            buffer: vec![0u8; BUFFER_SIZE],
        }
    }

    /// The next chunk, or `None` at end of stream or on a read error.
    async fn next(&mut self, session: &Session) -> Option<Bytes> {
        match self.reader.read(&mut self.buffer).await {
            Ok(0) => {
                debug!(side = ?self.side, "Connection reached end of stream");
                None
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&self.buffer[..n]);
                session.frames(self.side, &mut self.decoder, &chunk);
                Some(chunk)
            }
            Err(e) => {
                debug!(side = ?self.side, error = %e, "Failed to read from connection");
                None
            }
        }
    }
}
