//! Binding the proxy's own listening endpoints.
//!
//! Both transports are bound through [`ProxyListener::bind`] from a
//! [`CandidateAddress`], and accepted connections come back as [`Accepted`].
//! Dropping an IPC listener removes its socket file.

use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    config::{IpcConfig, WebSocketConfig},
    discovery::{DiscoveryError, discover},
    event::{ListenAddress, TransportKind},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAddress {
    WebSocket { host: String, port: u16 },
    InterProcess { slot: u16, path: PathBuf },
}

impl CandidateAddress {
    #[must_use]
    pub fn websocket(config: &WebSocketConfig, port: u16) -> Self {
        Self::WebSocket {
            host: config.host.clone(),
            port,
        }
    }

    #[must_use]
    pub fn ipc(config: &IpcConfig, slot: u16) -> Self {
        Self::InterProcess {
            slot,
            path: config.socket_path(slot),
        }
    }
}

#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Serve `wss://` on WebSocket candidates.
    pub tls: Option<TlsAcceptor>,
    /// Replace an IPC socket file that nothing is listening on.
    pub remove_stale_sockets: bool,
}

pub enum Accepted {
    WebSocket { stream: TcpStream, addr: SocketAddr },
    InterProcess { stream: UnixStream },
}

pub enum ProxyListener {
    WebSocket {
        listener: TcpListener,
        port: u16,
        tls: Option<TlsAcceptor>,
    },
    InterProcess(IpcListener),
}

impl ProxyListener {
    pub async fn bind(candidate: &CandidateAddress, options: &ListenOptions) -> io::Result<Self> {
        match candidate {
            CandidateAddress::WebSocket { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self::WebSocket {
                    port: listener.local_addr()?.port(),
                    listener,
                    tls: options.tls.clone(),
                })
            }
            CandidateAddress::InterProcess { slot, path } => {
                let listener = bind_unix(path, options.remove_stale_sockets).await?;
                Ok(Self::InterProcess(IpcListener {
                    listener,
                    slot: *slot,
                    path: path.clone(),
                }))
            }
        }
    }

    pub async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::WebSocket { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                Ok(Accepted::WebSocket { stream, addr })
            }
            Self::InterProcess(ipc) => {
                let (stream, _) = ipc.listener.accept().await?;
                Ok(Accepted::InterProcess { stream })
            }
        }
    }

    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        match self {
            Self::WebSocket { tls: Some(_), .. } => TransportKind::WebSocketSecure,
            Self::WebSocket { tls: None, .. } => TransportKind::WebSocketPlain,
            Self::InterProcess(_) => TransportKind::InterProcess,
        }
    }

    #[must_use]
    pub const fn address(&self) -> ListenAddress {
        match self {
            Self::WebSocket { port, .. } => ListenAddress::Port { port: *port },
            Self::InterProcess(ipc) => ListenAddress::Socket {
                socket_id: ipc.slot,
            },
        }
    }

    /// The port or slot this listener holds.
    #[must_use]
    pub const fn index(&self) -> u16 {
        match self.address() {
            ListenAddress::Port { port } => port,
            ListenAddress::Socket { socket_id } => socket_id,
        }
    }

    #[must_use]
    pub fn tls(&self) -> Option<&TlsAcceptor> {
        match self {
            Self::WebSocket { tls, .. } => tls.as_ref(),
            Self::InterProcess(_) => None,
        }
    }
}

/// A bound Unix socket that unlinks its path when dropped.
pub struct IpcListener {
    listener: UnixListener,
    slot: u16,
    path: PathBuf,
}

impl IpcListener {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

async fn bind_unix(path: &Path, remove_stale: bool) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if remove_stale && e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(e);
            }
            debug!(path = %path.display(), "Removing stale socket file");
            fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        result => result,
    }
}

/// Binds the first free port of the configured WebSocket range.
pub async fn bind_websocket(
    config: &WebSocketConfig,
    tls: Option<TlsAcceptor>,
) -> Result<ProxyListener, DiscoveryError> {
    let options = ListenOptions {
        tls,
        remove_stale_sockets: false,
    };
    let listener = discover(config.ports(), |port| {
        let candidate = CandidateAddress::websocket(config, port);
        let options = &options;
        async move { ProxyListener::bind(&candidate, options).await }
    })
    .await?;
    info!(
        host = %config.host,
        port = listener.index(),
        transport = %listener.transport(),
        "WebSocket listener bound"
    );
    Ok(listener)
}

/// Binds the first free slot of the configured IPC range.
pub async fn bind_ipc(config: &IpcConfig) -> Result<ProxyListener, DiscoveryError> {
    let options = ListenOptions {
        tls: None,
        remove_stale_sockets: config.remove_stale_sockets,
    };
    let listener = discover(config.slots(), |slot| {
        let candidate = CandidateAddress::ipc(config, slot);
        let options = &options;
        async move { ProxyListener::bind(&candidate, options).await }
    })
    .await?;
    if let ProxyListener::InterProcess(ipc) = &listener {
        info!(path = %ipc.path().display(), slot = ipc.slot, "IPC listener bound");
    }
    Ok(listener)
}
