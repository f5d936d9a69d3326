//! Structured event records describing what crosses the proxy.
//!
//! Each record serializes to one JSON object:
//!
//! ```json
//! {"evt":"message","id":1,"body":"hello","bodyType":"string","transport":"ws","receiver":"server","timestamp":[0,5120]}
//! ```

use serde::Serialize;
use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::classify::Body;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportKind {
    #[serde(rename = "ipc")]
    InterProcess,
    #[serde(rename = "ws")]
    WebSocketPlain,
    #[serde(rename = "wss")]
    WebSocketSecure,
}

impl TransportKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InterProcess => "ipc",
            Self::WebSocketPlain => "ws",
            Self::WebSocketSecure => "wss",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which party receives the traffic an event describes.
///
/// Data read from the proxy's own client is headed for the real endpoint and
/// is tagged [`Receiver::Server`]; data read from the real endpoint is tagged
/// [`Receiver::Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Receiver {
    Client,
    Server,
    Both,
}

/// Monotonic `[seconds, nanoseconds]` since process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp(pub u64, pub u32);

impl From<Duration> for Timestamp {
    fn from(elapsed: Duration) -> Self {
        Self(elapsed.as_secs(), elapsed.subsec_nanos())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ListenAddress {
    Port {
        port: u16,
    },
    Socket {
        #[serde(rename = "socketId")]
        socket_id: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "evt", rename_all = "kebab-case")]
pub enum Event {
    Listening {
        #[serde(flatten)]
        address: ListenAddress,
    },
    Connection {
        id: u32,
    },
    Open {
        id: u32,
    },
    Message {
        id: u32,
        #[serde(flatten)]
        body: Body,
        #[serde(rename = "bodyPrefix", skip_serializing_if = "Option::is_none")]
        body_prefix: Option<String>,
    },
    PingPong {
        id: u32,
    },
    Close {
        id: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: Event,
    pub transport: TransportKind,
    pub receiver: Receiver,
    pub timestamp: Timestamp,
}

/// Destination for event records.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Writes each record as one line of JSON.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl JsonLinesSink<io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, record: EventRecord) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, &record)
            .map_err(io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            warn!(error = %e, "Failed to write event record");
        }
    }
}

/// Forwards records into a channel, for embedding and tests.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, record: EventRecord) {
        let _ = self.tx.send(record);
    }
}

/// Stamps events relative to process start and hands them to a sink.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    epoch: Instant,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            epoch: Instant::now(),
        }
    }

    pub fn emit(&self, transport: TransportKind, receiver: Receiver, event: Event) {
        self.sink.emit(EventRecord {
            event,
            transport,
            receiver,
            timestamp: self.epoch.elapsed().into(),
        });
    }

    pub fn listening(&self, transport: TransportKind, address: ListenAddress) {
        self.emit(transport, Receiver::Both, Event::Listening { address });
    }

    pub fn message(
        &self,
        transport: TransportKind,
        receiver: Receiver,
        id: u32,
        body: Body,
        body_prefix: Option<String>,
    ) {
        self.emit(
            transport,
            receiver,
            Event::Message {
                id,
                body,
                body_prefix,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BinaryEncoding;
    use serde_json::json;

    fn record(event: Event, transport: TransportKind, receiver: Receiver) -> serde_json::Value {
        serde_json::to_value(EventRecord {
            event,
            transport,
            receiver,
            timestamp: Timestamp(3, 250),
        })
        .unwrap()
    }

    #[test]
    fn websocket_listening_reports_port() {
        let value = record(
            Event::Listening {
                address: ListenAddress::Port { port: 6463 },
            },
            TransportKind::WebSocketPlain,
            Receiver::Both,
        );
        assert_eq!(
            value,
            json!({
                "evt": "listening",
                "port": 6463,
                "transport": "ws",
                "receiver": "both",
                "timestamp": [3, 250]
            })
        );
    }

    #[test]
    fn ipc_listening_reports_socket_id() {
        let value = record(
            Event::Listening {
                address: ListenAddress::Socket { socket_id: 2 },
            },
            TransportKind::InterProcess,
            Receiver::Both,
        );
        assert_eq!(value["socketId"], 2);
        assert_eq!(value["transport"], "ipc");
        assert!(value.get("port").is_none());
    }

    #[test]
    fn message_carries_body_and_type() {
        let value = record(
            Event::Message {
                id: 1,
                body: Body::Text("hello".to_string()),
                body_prefix: None,
            },
            TransportKind::WebSocketPlain,
            Receiver::Server,
        );
        assert_eq!(
            value,
            json!({
                "evt": "message",
                "id": 1,
                "body": "hello",
                "bodyType": "string",
                "transport": "ws",
                "receiver": "server",
                "timestamp": [3, 250]
            })
        );
    }

    #[test]
    fn ipc_message_carries_prefix() {
        let value = record(
            Event::Message {
                id: 4,
                body: Body::Binary {
                    encoding: BinaryEncoding::Hex,
                    data: "00ff".to_string(),
                },
                body_prefix: Some("0300000002000000".to_string()),
            },
            TransportKind::InterProcess,
            Receiver::Client,
        );
        assert_eq!(value["bodyType"], "binary:hex");
        assert_eq!(value["bodyPrefix"], "0300000002000000");
    }

    #[test]
    fn lifecycle_events_use_kebab_case() {
        let value = record(
            Event::PingPong { id: 7 },
            TransportKind::WebSocketSecure,
            Receiver::Client,
        );
        assert_eq!(value["evt"], "ping-pong");
        assert_eq!(value["transport"], "wss");
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_record() {
        let sink = Arc::new(JsonLinesSink::new(Vec::new()));
        let emitter = Emitter::new(sink.clone());
        emitter.emit(
            TransportKind::InterProcess,
            Receiver::Both,
            Event::Connection { id: 1 },
        );
        emitter.emit(
            TransportKind::InterProcess,
            Receiver::Server,
            Event::Close { id: 1 },
        );
        drop(emitter);

        let sink = Arc::into_inner(sink).unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["evt"], "connection");
        assert_eq!(lines[1]["evt"], "close");
        assert_eq!(lines[1]["receiver"], "server");
    }
}
