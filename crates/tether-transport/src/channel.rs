// Transport seam consumed by the subscriber core, plus its QUIC
// implementation.
//
// The core opens one channel per connection and speaks to it only through
// these traits, so tests can substitute an in-memory peer. The QUIC side
// keeps no wrapper types of its own: the factory owns the dialing endpoint,
// and a channel is just a live quinn connection plus the body cap.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_wire::{
    AcknowledgeRequest, Message, ModifyAckDeadlineRequest, PullRequest, PullResponse, Status,
    StreamRequest, StreamResponse,
};

use crate::TransportConfig;
use crate::frame_io::{read_message, write_message};

/// Outgoing half of one logical subscriber stream.
#[async_trait]
pub trait StreamSink: Send {
    async fn send(&mut self, request: StreamRequest) -> Result<(), Status>;

    /// Half-close the stream after a best-effort final flush.
    async fn close(&mut self) -> Result<(), Status>;
}

/// Incoming half of one logical subscriber stream.
///
/// `recv` returns one server frame per call, so the caller controls inbound
/// flow: no further frame is requested until the previous one was processed.
#[async_trait]
pub trait StreamSource: Send {
    async fn recv(&mut self) -> Result<Option<StreamResponse>, Status>;
}

/// One transport channel. Each subscriber connection owns exactly one.
#[async_trait]
pub trait SubscriberChannel: Send + Sync {
    async fn open_stream(
        &self,
        initial: StreamRequest,
    ) -> Result<(Box<dyn StreamSink>, Box<dyn StreamSource>), Status>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, Status>;

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status>;

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status>;
}

/// Builds one channel per subscriber connection.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn SubscriberChannel>, Status>;
}

fn unavailable(what: &str, err: impl std::fmt::Display) -> Status {
    Status::unavailable(format!("{what}: {err}"))
}

/// QUIC-backed channel factory.
///
/// Every `open_channel` call dials a fresh connection so per-connection
/// stream limits never serialise traffic across the fan-out. Construct it
/// from within the runtime; quinn drives its sockets on the ambient
/// executor.
pub struct QuicChannelFactory {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    server_name: String,
    max_body_bytes: usize,
}

impl QuicChannelFactory {
    pub fn new(
        bind_addr: SocketAddr,
        mut tls: quinn::ClientConfig,
        tuning: TransportConfig,
        server_addr: SocketAddr,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        tls.transport_config(Arc::new(tuning.to_quinn()));
        let mut endpoint = Endpoint::client(bind_addr).context("bind subscriber endpoint")?;
        endpoint.set_default_client_config(tls);
        Ok(Self {
            endpoint,
            server_addr,
            server_name: server_name.into(),
            max_body_bytes: tuning.max_body_bytes,
        })
    }
}

#[async_trait]
impl ChannelFactory for QuicChannelFactory {
    async fn open_channel(&self) -> Result<Arc<dyn SubscriberChannel>, Status> {
        let connection = self
            .endpoint
            .connect(self.server_addr, &self.server_name)
            .map_err(|err| unavailable("dial subscriber channel", err))?
            .await
            .map_err(|err| unavailable("dial subscriber channel", err))?;
        tracing::debug!(peer = %connection.remote_address(), "subscriber channel ready");
        Ok(Arc::new(QuicSubscriberChannel {
            connection,
            max_body_bytes: self.max_body_bytes,
        }))
    }
}

struct QuicSubscriberChannel {
    connection: Connection,
    max_body_bytes: usize,
}

impl QuicSubscriberChannel {
    // One unary call is one round trip on a fresh bidi stream.
    async fn unary(&self, request: Message) -> Result<Message, Status> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|err| unavailable("open unary stream", err))?;
        write_message(&mut send, &request)
            .await
            .map_err(|err| unavailable("send unary request", err))?;
        send.finish()
            .map_err(|err| unavailable("finish unary request", err))?;
        let mut scratch = BytesMut::with_capacity(16 * 1024);
        match read_message(&mut recv, &mut scratch, self.max_body_bytes).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(Status::unavailable("stream closed before response")),
            Err(err) => Err(unavailable("read unary response", err)),
        }
    }
}

#[async_trait]
impl SubscriberChannel for QuicSubscriberChannel {
    async fn open_stream(
        &self,
        initial: StreamRequest,
    ) -> Result<(Box<dyn StreamSink>, Box<dyn StreamSource>), Status> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|err| unavailable("open subscriber stream", err))?;
        write_message(&mut send, &Message::StreamRequest(initial))
            .await
            .map_err(|err| unavailable("send initial stream request", err))?;
        let sink = QuicStreamSink { send };
        let source = QuicStreamSource {
            recv,
            scratch: BytesMut::with_capacity(64 * 1024),
            max_body_bytes: self.max_body_bytes,
        };
        Ok((Box::new(sink), Box::new(source)))
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, Status> {
        match self.unary(Message::PullRequest(request)).await? {
            Message::PullResponse(response) => Ok(response),
            Message::OpError(status) => Err(status),
            other => Err(Status::internal(format!(
                "unexpected pull response: {other:?}"
            ))),
        }
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status> {
        match self.unary(Message::Acknowledge(request)).await? {
            Message::OpOk => Ok(()),
            Message::OpError(status) => Err(status),
            other => Err(Status::internal(format!(
                "unexpected acknowledge response: {other:?}"
            ))),
        }
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status> {
        match self.unary(Message::ModifyAckDeadline(request)).await? {
            Message::OpOk => Ok(()),
            Message::OpError(status) => Err(status),
            other => Err(Status::internal(format!(
                "unexpected modify response: {other:?}"
            ))),
        }
    }
}

struct QuicStreamSink {
    send: SendStream,
}

#[async_trait]
impl StreamSink for QuicStreamSink {
    async fn send(&mut self, request: StreamRequest) -> Result<(), Status> {
        write_message(&mut self.send, &Message::StreamRequest(request))
            .await
            .map_err(|err| unavailable("send stream request", err))
    }

    async fn close(&mut self) -> Result<(), Status> {
        self.send
            .finish()
            .map_err(|err| unavailable("close stream", err))
    }
}

struct QuicStreamSource {
    recv: RecvStream,
    scratch: BytesMut,
    max_body_bytes: usize,
}

#[async_trait]
impl StreamSource for QuicStreamSource {
    async fn recv(&mut self) -> Result<Option<StreamResponse>, Status> {
        match read_message(&mut self.recv, &mut self.scratch, self.max_body_bytes).await {
            Ok(Some(Message::StreamResponse(response))) => Ok(Some(response)),
            Ok(Some(Message::OpError(status))) => Err(status),
            Ok(Some(_)) => Err(Status::internal(
                "unexpected message on subscription stream",
            )),
            Ok(None) => Ok(None),
            Err(err) => Err(unavailable("read stream response", err)),
        }
    }
}
