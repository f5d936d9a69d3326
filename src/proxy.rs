//! WebSocket relay sessions.

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{
    net::SocketAddr,
    ops::RangeInclusive,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async,
    tungstenite::{
        Error as TungsteniteError, Message,
        client::IntoClientRequest,
        error::ProtocolError,
        handshake::server::{Request, Response},
        http::{HeaderValue, header::ORIGIN},
        protocol::CloseFrame,
    },
};
use tracing::{debug, error, info};

use crate::{
    context::ProxyContext,
    discovery::{DiscoveryError, discover},
    session::{QUEUE_CAPACITY, Session, Side},
    stream::ClientStream,
};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the real WebSocket endpoint is looked for.
#[derive(Debug, Clone)]
pub struct WebSocketUpstream {
    pub host: String,
    pub ports: RangeInclusive<u16>,
    pub connect_timeout: Duration,
}

/// Parts of the client's upgrade request repeated on the upstream dial.
#[derive(Debug, Clone)]
struct Handshake {
    path: String,
    origin: Option<HeaderValue>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            origin: None,
        }
    }
}

#[tracing::instrument(skip_all, fields(client_addr = %client_addr))]
pub async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: Arc<ProxyContext>,
    upstream: Arc<WebSocketUpstream>,
) -> Result<()> {
    let stream = match tls {
        Some(acceptor) => ClientStream::Tls(Box::new(
            acceptor
                .accept(stream)
                .await
                .context("Failed to perform TLS handshake")?,
        )),
        None => ClientStream::Plain(stream),
    };
    let transport = stream.transport();

    let handshake = Arc::new(Mutex::new(None::<Handshake>));
    let handshake_clone = handshake.clone();
    let callback = move |req: &Request, response: Response| {
        let captured = Handshake {
            path: req
                .uri()
                .path_and_query()
                .map_or_else(|| "/".to_string(), ToString::to_string),
            origin: req.headers().get(ORIGIN).cloned(),
        };
        if let Ok(mut guard) = handshake_clone.lock() {
            *guard = Some(captured);
        }
        Ok(response)
    };

    let websocket = accept_hdr_async(stream, callback)
        .await
        .context("Failed to perform WebSocket handshake")?;
    let handshake = handshake
        .lock()
        .ok()
        .and_then(|mut guard| guard.take())
        .unwrap_or_default();

    debug!(path = %handshake.path, "Client handshake complete");
    let session = Session::accept(&ctx, transport);
    relay(websocket, &session, &upstream, &handshake).await;
    Ok(())
}

async fn dial_upstream(
    target: &WebSocketUpstream,
    handshake: &Handshake,
) -> Result<(UpstreamSocket, u16), DiscoveryError> {
    discover(target.ports.clone(), |port| {
        let url = format!("ws://{}:{port}{}", target.host, handshake.path);
        let origin = handshake.origin.clone();
        let connect_timeout = target.connect_timeout;
        async move {
            let mut request = url.as_str().into_client_request()?;
            if let Some(origin) = origin {
                request.headers_mut().insert(ORIGIN, origin);
            }
            let (socket, _) = timeout(connect_timeout, connect_async(request))
                .await
                .with_context(|| format!("Timed out connecting to {url}"))?
                .with_context(|| format!("Failed to connect to {url}"))?;
            Ok::<_, anyhow::Error>((socket, port))
        }
    })
    .await
}

/// Relays one accepted WebSocket until both sides have closed.
///
/// The upstream is dialed while the client is already being read, so
/// messages that arrive first wait in the upstream queue.
async fn relay<S>(
    downstream: WebSocketStream<S>,
    session: &Session,
    target: &WebSocketUpstream,
    handshake: &Handshake,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_sink, client_stream) = downstream.split();
    let (to_upstream, upstream_queue) = mpsc::channel::<Message>(QUEUE_CAPACITY);
    let (to_client, client_queue) = mpsc::channel::<Message>(QUEUE_CAPACITY);

    let client_to_upstream = async move {
        pump(client_stream, Side::Downstream, session, &to_upstream).await;
        session.side_closed(Side::Downstream);
    };

    let client_writer = drain(client_sink, client_queue, Side::Downstream);

    let upstream_side = async move {
        session.upstream_pending();
        let (socket, port) = match dial_upstream(target, handshake).await {
            Ok(dialed) => dialed,
            Err(e) => {
                session.upstream_failed(&e);
                return;
            }
        };
        info!(id = session.id(), port, "Connected to upstream endpoint");
        session.upstream_connected();

        let (upstream_sink, upstream_stream) = socket.split();
        let upstream_to_client = async move {
            pump(upstream_stream, Side::Upstream, session, &to_client).await;
            session.side_closed(Side::Upstream);
        };
        tokio::join!(
            drain(upstream_sink, upstream_queue, Side::Upstream),
            upstream_to_client
        );
    };

    tokio::join!(client_to_upstream, client_writer, upstream_side);
}

/// Reads `source` until it ends, logging each data message and queueing
/// everything, including the close, for the opposite side.
///
/// Reading continues after a close frame so the close reply gets flushed.
async fn pump<St>(
    mut source: St,
    side: Side,
    session: &Session,
    destination: &mpsc::Sender<Message>,
) where
    St: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
{
    let mut close_forwarded = false;
    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => {
                session.message(side, text.as_bytes());
                Message::Text(text)
            }
            Ok(Message::Binary(data)) => {
                session.message(side, &data);
                Message::Binary(data)
            }
            Ok(msg @ (Message::Ping(_) | Message::Pong(_))) => {
                session.ping_pong(side);
                msg
            }
            Ok(Message::Close(frame)) => {
                debug!(?side, ?frame, "Close received");
                close_forwarded = true;
                Message::Close(frame.filter(is_sendable))
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => {
                match e {
                    TungsteniteError::ConnectionClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!(?side, "Peer disconnected: {e}");
                    }
                    _ => error!(?side, "WebSocket error: {e}"),
                }
                break;
            }
        };
        // A closed queue means there is nothing on the other side to deliver to.
        let _ = destination.send(msg).await;
    }
    if !close_forwarded {
        let _ = destination.send(Message::Close(None)).await;
    }
}

/// Writes queued messages to `sink` in order until a close is forwarded or
/// the queue's senders are gone.
async fn drain<Si>(mut sink: Si, mut queue: mpsc::Receiver<Message>, side: Side)
where
    Si: Sink<Message, Error = TungsteniteError> + Unpin,
{
    while let Some(msg) = queue.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            if closing {
                debug!(?side, "Close propagation failed, closing unconditionally: {e}");
                let _ = sink.close().await;
            } else {
                error!(?side, "Failed to forward WebSocket message: {e}");
            }
            return;
        }
        if closing {
            return;
        }
    }
}

/// Codes that may appear in a close frame on the wire.
fn is_sendable(frame: &CloseFrame) -> bool {
    matches!(u16::from(frame.code), 1000..=1003 | 1007..=1014 | 3000..=4999)
}
