//! Stream multiplexing contracts and registry.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SwitchResult;
use crate::stream::SwitchStream;

/// A stream multiplexer running over one encrypted connection.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Open a new outbound substream.
    async fn open_stream(&self) -> SwitchResult<SwitchStream>;

    /// Wait for the next substream opened by the remote.
    ///
    /// Returns `None` once the muxer has closed, which is how the close of
    /// the underlying connection is observed.
    async fn next_inbound(&self) -> Option<SwitchStream>;

    /// End the muxer, closing every substream.
    async fn close(&self) -> SwitchResult<()>;
}

/// Factory instantiating a muxer protocol over an established stream.
pub trait MuxerFactory: Send + Sync {
    /// Protocol name announced during muxer negotiation.
    fn multicodec(&self) -> &str;

    /// Instantiate the dialer side.
    fn dialer(&self, stream: SwitchStream) -> Arc<dyn Muxer>;

    /// Instantiate the listener side.
    fn listener(&self, stream: SwitchStream) -> Arc<dyn Muxer>;
}

/// Registered muxer factories, iterated in insertion order during
/// negotiation.
#[derive(Default)]
pub struct MuxerRegistry {
    entries: Vec<(String, Arc<dyn MuxerFactory>)>,
}

impl MuxerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its multicodec. Re-registering a codec
    /// replaces the factory but keeps its original position.
    pub fn add(&mut self, factory: Arc<dyn MuxerFactory>) {
        let codec = factory.multicodec().to_string();
        if let Some(entry) = self.entries.iter_mut().find(|(tag, _)| *tag == codec) {
            entry.1 = factory;
        } else {
            self.entries.push((codec, factory));
        }
    }

    /// Whether no muxer is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered multicodecs in insertion order.
    pub fn codecs(&self) -> Vec<String> {
        self.entries.iter().map(|(tag, _)| tag.clone()).collect()
    }

    /// Look up a factory by multicodec.
    pub fn get(&self, codec: &str) -> Option<Arc<dyn MuxerFactory>> {
        self.entries
            .iter()
            .find(|(tag, _)| tag == codec)
            .map(|(_, f)| f.clone())
    }
}
