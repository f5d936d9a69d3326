//! Lifecycle bookkeeping shared by both relay implementations.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    classify::{BinaryEncoding, Body, classify_payload},
    context::ProxyContext,
    event::{Emitter, Event, Receiver, TransportKind},
    frame::{FrameError, FrameStream},
    ids::SessionLease,
};

/// Bounded per-destination queue length; readers wait when it is full.
pub const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local client that connected to the proxy.
    Downstream,
    /// The real endpoint the proxy dialed.
    Upstream,
}

impl Side {
    /// Role tagged on events for traffic read from this side.
    #[must_use]
    pub const fn receiver(self) -> Receiver {
        match self {
            Self::Downstream => Receiver::Server,
            Self::Upstream => Receiver::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    UpstreamPending,
    Relaying,
    /// The given side has closed, the other is still open.
    HalfClosed(Side),
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::UpstreamPending => f.write_str("upstream-pending"),
            Self::Relaying => f.write_str("relaying"),
            Self::HalfClosed(Side::Downstream) => f.write_str("half-closed(downstream)"),
            Self::HalfClosed(Side::Upstream) => f.write_str("half-closed(upstream)"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// One client/upstream pairing. Holds its identity until dropped.
pub struct Session {
    lease: SessionLease,
    emitter: Emitter,
    encoding: BinaryEncoding,
    opened_at: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    /// Registers a freshly accepted downstream connection and emits its
    /// `connection` event.
    pub fn accept(ctx: &ProxyContext, transport: TransportKind) -> Self {
        let lease = ctx.sessions.open(transport);
        let session = Self {
            lease,
            emitter: ctx.emitter.clone(),
            encoding: ctx.encoding,
            opened_at: Instant::now(),
            state: Mutex::new(SessionState::Accepted),
        };
        session.emit(Receiver::Both, Event::Connection { id: session.id() });
        info!(%transport, id = session.id(), "Session accepted");
        session
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.lease.id()
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.lease.transport()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, next: impl FnOnce(SessionState) -> SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        *state = next(previous);
        if *state != previous {
            debug!(id = self.id(), from = %previous, to = %*state, "Session state changed");
        }
        *state
    }

    fn emit(&self, receiver: Receiver, event: Event) {
        self.emitter.emit(self.transport(), receiver, event);
    }

    pub fn upstream_pending(&self) {
        self.update(|state| match state {
            SessionState::Accepted => SessionState::UpstreamPending,
            other => other,
        });
    }

    /// The upstream dial succeeded; emits `open`.
    pub fn upstream_connected(&self) {
        self.update(|state| match state {
            SessionState::Accepted | SessionState::UpstreamPending => SessionState::Relaying,
            other => other,
        });
        self.emit(Receiver::Client, Event::Open { id: self.id() });
    }

    /// The upstream dial ran out of candidates. The downstream stays open and
    /// anything it sends is dropped.
    pub fn upstream_failed(&self, error: &dyn fmt::Display) {
        warn!(
            transport = %self.transport(),
            id = self.id(),
            error = %error,
            "No upstream endpoint reachable, relaying downstream only"
        );
        self.update(|state| match state {
            SessionState::HalfClosed(Side::Downstream) | SessionState::Closed => {
                SessionState::Closed
            }
            _ => SessionState::HalfClosed(Side::Upstream),
        });
    }

    /// Records that `side` closed and emits its `close` event. Returns true
    /// once both sides are closed.
    pub fn side_closed(&self, side: Side) -> bool {
        let state = self.update(|state| match state {
            SessionState::HalfClosed(other) if other != side => SessionState::Closed,
            SessionState::HalfClosed(_) | SessionState::Closed => state,
            _ => SessionState::HalfClosed(side),
        });
        self.emit(side.receiver(), Event::Close { id: self.id() });
        state == SessionState::Closed
    }

    /// Classifies one delimited payload read from `side` and emits it.
    pub fn message(&self, side: Side, payload: &[u8]) {
        let body = classify_payload(payload, self.encoding);
        self.emit_body(side, body, None);
    }

    /// Feeds a raw IPC chunk read from `side` to its frame decoder and emits
    /// every frame it completes.
    pub fn frames(&self, side: Side, decoder: &mut FrameStream, chunk: &[u8]) {
        match decoder.push(chunk) {
            Ok(frames) => {
                for frame in frames {
                    self.emit_body(side, frame.body, Some(frame.header_hex));
                }
            }
            Err(FrameError::TooLarge { declared, max }) => {
                warn!(
                    id = self.id(),
                    declared, max, "Frame exceeds size limit, skipping buffered bytes"
                );
            }
            Err(e) => warn!(id = self.id(), error = %e, "Failed to decode frame"),
        }
    }

    pub fn ping_pong(&self, side: Side) {
        self.emit(side.receiver(), Event::PingPong { id: self.id() });
    }

    fn emit_body(&self, side: Side, body: Body, body_prefix: Option<String>) {
        self.emitter
            .message(self.transport(), side.receiver(), self.id(), body, body_prefix);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        info!(
            transport = %self.transport(),
            id = self.id(),
            state = %self.state(),
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "Session finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        event::{ChannelSink, EventRecord},
    };
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context() -> (Arc<ProxyContext>, UnboundedReceiver<EventRecord>) {
        let (sink, rx) = ChannelSink::new();
        (ProxyContext::new(&Config::default(), Arc::new(sink)), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<EventRecord>) -> Vec<EventRecord> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn full_lifecycle_emits_each_event_once() {
        let (ctx, mut rx) = context();
        let session = Session::accept(&ctx, TransportKind::WebSocketPlain);
        assert_eq!(session.id(), 1);
        assert_eq!(session.state(), SessionState::Accepted);

        session.upstream_pending();
        assert_eq!(session.state(), SessionState::UpstreamPending);
        session.upstream_connected();
        assert_eq!(session.state(), SessionState::Relaying);

        session.message(Side::Downstream, b"hello");
        assert!(!session.side_closed(Side::Upstream));
        assert_eq!(session.state(), SessionState::HalfClosed(Side::Upstream));
        assert!(session.side_closed(Side::Downstream));
        assert_eq!(session.state(), SessionState::Closed);

        let events: Vec<(Event, Receiver)> = drain(&mut rx)
            .into_iter()
            .map(|record| (record.event, record.receiver))
            .collect();
        assert_eq!(
            events,
            vec![
                (Event::Connection { id: 1 }, Receiver::Both),
                (Event::Open { id: 1 }, Receiver::Client),
                (
                    Event::Message {
                        id: 1,
                        body: Body::Text("hello".to_string()),
                        body_prefix: None
                    },
                    Receiver::Server
                ),
                (Event::Close { id: 1 }, Receiver::Client),
                (Event::Close { id: 1 }, Receiver::Server),
            ]
        );
    }

    #[test]
    fn failed_upstream_closes_with_downstream() {
        let (ctx, mut rx) = context();
        let session = Session::accept(&ctx, TransportKind::InterProcess);
        session.upstream_pending();
        session.upstream_failed(&"no endpoint");
        assert_eq!(session.state(), SessionState::HalfClosed(Side::Upstream));
        assert!(session.side_closed(Side::Downstream));

        let kinds: Vec<Event> = drain(&mut rx).into_iter().map(|r| r.event).collect();
        assert_eq!(
            kinds,
            vec![Event::Connection { id: 1 }, Event::Close { id: 1 }]
        );
    }

    #[test]
    fn identity_is_released_when_session_drops() {
        let (ctx, _rx) = context();
        let first = Session::accept(&ctx, TransportKind::WebSocketPlain);
        let second = Session::accept(&ctx, TransportKind::WebSocketPlain);
        assert_eq!((first.id(), second.id()), (1, 2));
        assert_eq!(ctx.sessions.active(TransportKind::WebSocketPlain), 2);

        drop(first);
        let third = Session::accept(&ctx, TransportKind::WebSocketPlain);
        assert_eq!(third.id(), 1);
    }

    #[test]
    fn frames_are_emitted_with_their_prefix() {
        let (ctx, mut rx) = context();
        let session = Session::accept(&ctx, TransportKind::InterProcess);
        let mut decoder = FrameStream::new(1024, BinaryEncoding::Base64);
        session.frames(
            Side::Upstream,
            &mut decoder,
            &[1, 0, 0, 0, 2, 0, 0, 0, b'{', b'}'],
        );

        let records = drain(&mut rx);
        let record = records.last().unwrap();
        assert_eq!(record.receiver, Receiver::Client);
        assert_eq!(
            record.event,
            Event::Message {
                id: 1,
                body: Body::Json(serde_json::json!({})),
                body_prefix: Some("0100000002000000".to_string()),
            }
        );
    }
}
