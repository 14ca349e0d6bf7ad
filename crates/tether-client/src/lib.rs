//! Subscriber client core for the tether message-delivery service.
//!
//! # Purpose
//! Pulls messages from a named subscription over one or more long-lived
//! streams (or unary polls), hands each message to a user handler, and
//! returns acks and nacks to the server while keeping slow messages leased
//! through periodic deadline extensions.
//!
//! # Design notes
//! The [`Subscriber`] supervisor fans out one connection per stream; each
//! connection owns an ack pump that batches outgoing acknowledgement
//! operations. The latency distribution and flow controller are the only
//! state shared across connections.
pub mod config;
mod connection;
pub mod distribution;
pub mod flow;
mod handler;
mod pump;
mod subscriber;

#[cfg(test)]
mod tests;

pub use config::{PullMode, SubscriberConfig};
pub use distribution::LatencyDistribution;
pub use flow::{FlowControlSettings, FlowController, FlowError, LimitBehavior, Reservation};
pub use handler::{MessageHandler, Reply};
pub use subscriber::{Subscriber, SubscriberState};

pub use tether_transport::{
    ChannelFactory, StreamSink, StreamSource, SubscriberChannel, TransportConfig,
};
pub use tether_wire::{ReceivedMessage, Status, StatusCode};
