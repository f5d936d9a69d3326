//! RPC Tap
//!
//! A transparent proxy that sits in front of a desktop application's local
//! RPC endpoints, over both a loopback WebSocket and a Unix IPC socket, and
//! reports every message crossing it as a structured JSON event.

#[cfg(not(unix))]
compile_error!("rpc-tap relays Unix domain sockets and only builds on Unix platforms");

pub mod classify;
pub mod config;
pub mod context;
pub mod discovery;
pub mod event;
pub mod frame;
pub mod ids;
pub mod ipc;
pub mod listener;
pub mod proxy;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use classify::{BinaryEncoding, Body, classify_payload, is_likely_text};
pub use config::{Config, IpcConfig, TlsConfig, WebSocketConfig, load_config, resolve_config};
pub use context::ProxyContext;
pub use discovery::{DiscoveryError, discover};
pub use event::{ChannelSink, Emitter, Event, EventRecord, EventSink, JsonLinesSink, Receiver, TransportKind};
pub use frame::{Frame, FrameCodec, FrameStream, decode_frames};
pub use ids::{IdPool, SessionRegistry};
pub use listener::{CandidateAddress, ProxyListener};
pub use server::{Endpoint, Proxy, shutdown_notice};
pub use session::{Session, SessionState, Side};
