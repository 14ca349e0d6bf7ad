//! RPC layer for the subscriber client.
//!
//! # Purpose
//! Defines the channel seam the connection core drives
//! ([`ChannelFactory`] / [`SubscriberChannel`] / [`StreamSink`] /
//! [`StreamSource`]) together with its QUIC implementation, and the message
//! IO that frames tether-wire messages onto streams.
//!
//! # Design notes
//! The subscriber only ever dials out, so there is no server surface here;
//! loopback peers for tests are assembled from quinn directly where they are
//! needed.
mod channel;
pub mod frame_io;

pub use channel::{
    ChannelFactory, QuicChannelFactory, StreamSink, StreamSource, SubscriberChannel,
};

/// Tuning applied to every channel a factory opens.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest message body accepted off the wire. Oversized frames are
    /// refused from the preamble alone, before any buffer is reserved.
    pub max_body_bytes: usize,
    /// Concurrent stream budget each connection grants its peer.
    pub max_concurrent_streams: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Sized for batched subscriber traffic: a full ack batch of long ack
        // ids still fits in a single body with room to spare.
        Self {
            max_body_bytes: 8 * 1024 * 1024,
            max_concurrent_streams: 256,
        }
    }
}

impl TransportConfig {
    pub(crate) fn to_quinn(&self) -> quinn::TransportConfig {
        let mut quinn_config = quinn::TransportConfig::default();
        quinn_config
            .max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_streams));
        quinn_config
    }
}
