//! Accept loops for the proxy's listeners.

use anyhow::{Context, Result};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    context::ProxyContext,
    discovery::after,
    event::TransportKind,
    ipc::{self, IpcUpstream},
    listener::{Accepted, ProxyListener, bind_ipc, bind_websocket},
    proxy::{self, WebSocketUpstream},
    tls::load_tls_acceptor,
};

/// Where sessions accepted on an endpoint are relayed to.
#[derive(Debug, Clone)]
pub enum UpstreamTarget {
    WebSocket(Arc<WebSocketUpstream>),
    InterProcess(Arc<IpcUpstream>),
}

/// A bound listener paired with the range its upstream is searched in.
pub struct Endpoint {
    pub listener: ProxyListener,
    pub upstream: UpstreamTarget,
}

impl Endpoint {
    /// Claims the first free WebSocket port; the real endpoint is expected
    /// on one of the ports after it.
    pub async fn websocket(config: &Config) -> Result<Self> {
        let ws = &config.websocket;
        let tls = ws.tls.as_ref().map(load_tls_acceptor).transpose()?;
        let listener = bind_websocket(ws, tls).await.with_context(|| {
            format!(
                "Failed to bind a WebSocket listener on {} ports {}..={}",
                ws.host, ws.port_start, ws.port_end
            )
        })?;
        let upstream = WebSocketUpstream {
            host: ws.host.clone(),
            ports: after(listener.index(), ws.port_end),
            connect_timeout: ws.connect_timeout(),
        };
        Ok(Self {
            listener,
            upstream: UpstreamTarget::WebSocket(Arc::new(upstream)),
        })
    }

    /// Claims the first free IPC slot; the real endpoint is expected on one
    /// of the slots after it.
    pub async fn ipc(config: &Config) -> Result<Self> {
        let ipc = &config.ipc;
        let listener = bind_ipc(ipc).await.with_context(|| {
            format!(
                "Failed to bind an IPC listener in {} slots {}..={}",
                ipc.runtime_dir().display(),
                ipc.slot_start,
                ipc.slot_end
            )
        })?;
        let upstream = IpcUpstream {
            config: ipc.clone(),
            slots: after(listener.index(), ipc.slot_end),
            connect_timeout: ipc.connect_timeout(),
        };
        Ok(Self {
            listener,
            upstream: UpstreamTarget::InterProcess(Arc::new(upstream)),
        })
    }

    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.listener.transport()
    }

    /// Accepts connections until `shutdown` fires, spawning one session task
    /// per connection onto `tracker`. The listener is released on return.
    pub async fn serve(
        self,
        ctx: Arc<ProxyContext>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> TransportKind {
        let Self { listener, upstream } = self;
        let transport = listener.transport();
        ctx.emitter.listening(transport, listener.address());
        info!(%transport, index = listener.index(), "Proxy listening");

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match (accepted, &upstream) {
                (Ok(Accepted::WebSocket { stream, addr }), UpstreamTarget::WebSocket(target)) => {
                    let tls = listener.tls().cloned();
                    let ctx = Arc::clone(&ctx);
                    let target = Arc::clone(target);
                    tracker.spawn(async move {
                        if let Err(e) = proxy::handle_connection(stream, addr, tls, ctx, target).await {
                            error!(client_addr = %addr, error = %e, "Connection failed");
                        }
                    });
                }
                (Ok(Accepted::InterProcess { stream }), UpstreamTarget::InterProcess(target)) => {
                    tracker.spawn(ipc::handle_connection(
                        stream,
                        Arc::clone(&ctx),
                        Arc::clone(target),
                    ));
                }
                (Ok(_), _) => error!(%transport, "Accepted connection does not match upstream kind"),
                (Err(e), _) => {
                    warn!(%transport, error = %e, "Failed to accept connection");
                    if !back_off(&shutdown).await {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!(%transport, "Listener closed");
        transport
    }
}

/// Pause after a failed accept, so errors such as running out of file
/// descriptors do not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits out [`ACCEPT_BACKOFF`]. Returns false if shutdown fired meanwhile.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

#[derive(Serialize)]
struct ShutdownNotice {
    signal: &'static str,
    transport: TransportKind,
}

/// The line printed for each listener closed by an interrupt.
#[must_use]
pub fn shutdown_notice(transport: TransportKind) -> String {
    serde_json::to_string(&ShutdownNotice {
        signal: "SIGINT",
        transport,
    })
    .unwrap_or_default()
}

/// A running proxy: its listener tasks and the sessions they spawned.
pub struct Proxy {
    listeners: Vec<JoinHandle<TransportKind>>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl Proxy {
    /// Binds every enabled transport and starts accepting. Failing to bind
    /// any enabled transport is fatal.
    pub async fn start(config: &Config, ctx: Arc<ProxyContext>) -> Result<Self> {
        let mut endpoints = Vec::new();
        if config.websocket.enabled {
            endpoints.push(Endpoint::websocket(config).await?);
        }
        if config.ipc.enabled {
            endpoints.push(Endpoint::ipc(config).await?);
        }

        let sessions = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let listeners = endpoints
            .into_iter()
            .map(|endpoint| {
                tokio::spawn(endpoint.serve(
                    Arc::clone(&ctx),
                    sessions.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Ok(Self {
            listeners,
            sessions,
            shutdown,
        })
    }

    /// Closes every listener and returns the transports that were closed.
    /// Sessions already open keep running.
    pub async fn close_listeners(&mut self) -> Vec<TransportKind> {
        self.shutdown.cancel();
        let mut closed = Vec::new();
        for handle in self.listeners.drain(..) {
            match handle.await {
                Ok(transport) => closed.push(transport),
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }
        closed
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Waits for every spawned session to finish.
    pub async fn drain_sessions(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChannelSink, Event, EventRecord, ListenAddress};
    use tempfile::TempDir;
    use tokio::{
        net::{TcpListener, UnixStream},
        sync::mpsc::UnboundedReceiver,
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn test_config(dir: &TempDir) -> Config {
        let port = free_port().await;
        let mut config = Config::default();
        config.websocket.port_start = port;
        config.websocket.port_end = port;
        config.ipc.runtime_dir = Some(dir.path().to_path_buf());
        config.ipc.prefix = "tap".to_string();
        config.ipc.slot_start = 3;
        config.ipc.slot_end = 5;
        config
    }

    async fn listening_events(events: &mut UnboundedReceiver<EventRecord>) -> Vec<EventRecord> {
        let mut records = Vec::new();
        while records.len() < 2 {
            let record = timeout(TEST_TIMEOUT, events.recv())
                .await
                .expect("timed out waiting for listening events")
                .expect("event channel closed");
            records.push(record);
        }
        records.sort_by_key(|record| record.transport.as_str());
        records
    }

    #[tokio::test]
    async fn start_binds_every_enabled_transport() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).await;
        let (sink, mut events) = ChannelSink::new();
        let ctx = ProxyContext::new(&config, Arc::new(sink));

        let mut proxy = Proxy::start(&config, ctx).await.unwrap();
        let records = listening_events(&mut events).await;

        assert_eq!(records[0].transport, TransportKind::InterProcess);
        assert_eq!(
            records[0].event,
            Event::Listening {
                address: ListenAddress::Socket { socket_id: 3 }
            }
        );
        assert_eq!(records[1].transport, TransportKind::WebSocketPlain);
        assert_eq!(
            records[1].event,
            Event::Listening {
                address: ListenAddress::Port {
                    port: config.websocket.port_start
                }
            }
        );
        let value = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(value["evt"], "listening");
        assert_eq!(value["socketId"], 3);

        let socket = config.ipc.socket_path(3);
        assert!(socket.exists());

        let closed = proxy.close_listeners().await;
        assert_eq!(
            closed,
            vec![TransportKind::WebSocketPlain, TransportKind::InterProcess]
        );
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn disabled_transports_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir).await;
        config.websocket.enabled = false;
        let (sink, _events) = ChannelSink::new();
        let ctx = ProxyContext::new(&config, Arc::new(sink));

        let mut proxy = Proxy::start(&config, ctx).await.unwrap();
        assert_eq!(proxy.close_listeners().await, vec![TransportKind::InterProcess]);
    }

    #[tokio::test]
    async fn exhausted_ipc_range_fails_start() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir).await;
        config.websocket.enabled = false;
        config.ipc.slot_start = 3;
        config.ipc.slot_end = 3;
        let _held = tokio::net::UnixListener::bind(config.ipc.socket_path(3)).unwrap();
        let (sink, _events) = ChannelSink::new();
        let ctx = ProxyContext::new(&config, Arc::new(sink));

        let error = Proxy::start(&config, ctx).await.err().unwrap();
        assert!(format!("{error:#}").contains("Failed to bind an IPC listener"));
    }

    #[tokio::test]
    async fn open_sessions_survive_listener_close() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir).await;
        config.websocket.enabled = false;
        let (sink, mut events) = ChannelSink::new();
        let ctx = ProxyContext::new(&config, Arc::new(sink));

        let mut proxy = Proxy::start(&config, ctx).await.unwrap();
        let client = UnixStream::connect(config.ipc.socket_path(3)).await.unwrap();
        loop {
            let record = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
            if matches!(record.event, Event::Connection { .. }) {
                break;
            }
        }

        proxy.close_listeners().await;
        assert_eq!(proxy.open_sessions(), 1);

        drop(client);
        timeout(TEST_TIMEOUT, proxy.drain_sessions()).await.unwrap();
        assert_eq!(proxy.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_back_off_before_retrying() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(back_off(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_ends_early_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!back_off(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[test]
    fn shutdown_notice_names_signal_and_transport() {
        assert_eq!(
            shutdown_notice(TransportKind::WebSocketPlain),
            r#"{"signal":"SIGINT","transport":"ws"}"#
        );
        assert_eq!(
            shutdown_notice(TransportKind::InterProcess),
            r#"{"signal":"SIGINT","transport":"ipc"}"#
        );
    }
}
