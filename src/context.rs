use std::sync::Arc;

use crate::{
    classify::BinaryEncoding,
    config::Config,
    event::{Emitter, EventSink},
    ids::SessionRegistry,
};

/// State shared by every listener and session of one proxy process.
pub struct ProxyContext {
    pub emitter: Emitter,
    pub sessions: Arc<SessionRegistry>,
    pub encoding: BinaryEncoding,
    pub max_frame_len: usize,
}

impl ProxyContext {
    pub fn new(config: &Config, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            emitter: Emitter::new(sink),
            sessions: SessionRegistry::new(),
            encoding: config.events.binary_encoding,
            max_frame_len: config.ipc.max_frame_len,
        })
    }
}
