// Subscriber protocol messages and their body codec.
//
// Bodies are flat big-endian fields: strings and byte blobs are length
// prefixed, collections are count prefixed. The message tag never appears in
// the body; it rides in the preamble (`WireHeader`).
use bytes::{Bytes, BytesMut};

use crate::{Error, Result, Status, StatusCode, WireHeader};

const TAG_STREAM_REQUEST: u8 = 1;
const TAG_STREAM_RESPONSE: u8 = 2;
const TAG_PULL_REQUEST: u8 = 3;
const TAG_PULL_RESPONSE: u8 = 4;
const TAG_ACKNOWLEDGE: u8 = 5;
const TAG_MODIFY_ACK_DEADLINE: u8 = 6;
const TAG_OP_OK: u8 = 7;
const TAG_OP_ERROR: u8 = 8;

/// One message delivered by the server, identified by its opaque ack id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub payload: Bytes,
}

/// A requested change to one message's ack deadline. Zero seconds is a nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineChange {
    pub ack_id: String,
    pub extension_seconds: u32,
}

/// Client frame on a streaming pull. The first frame of a stream carries the
/// subscription name and the initial stream ack deadline; later frames carry
/// ack/modify batches or a deadline-only update (zero means unchanged).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub subscription: String,
    pub stream_ack_deadline_seconds: u32,
    pub ack_ids: Vec<String>,
    pub modify_deadlines: Vec<DeadlineChange>,
}

impl StreamRequest {
    pub fn initial(subscription: impl Into<String>, stream_ack_deadline_seconds: u32) -> Self {
        Self {
            subscription: subscription.into(),
            stream_ack_deadline_seconds,
            ..Self::default()
        }
    }

    pub fn deadline_update(stream_ack_deadline_seconds: u32) -> Self {
        Self {
            stream_ack_deadline_seconds,
            ..Self::default()
        }
    }

    pub fn ack_batch(ack_ids: Vec<String>, modify_deadlines: Vec<DeadlineChange>) -> Self {
        Self {
            ack_ids,
            modify_deadlines,
            ..Self::default()
        }
    }

    /// Combined number of ack and modify entries carried by this frame.
    pub fn change_count(&self) -> usize {
        self.ack_ids.len() + self.modify_deadlines.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResponse {
    pub messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub subscription: String,
    pub max_messages: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResponse {
    pub messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyAckDeadlineRequest {
    pub subscription: String,
    pub ack_deadline_seconds: u32,
    pub ack_ids: Vec<String>,
}

/// Protocol message, one per frame.
///
/// ```
/// use tether_wire::{Message, PullRequest};
///
/// let message = Message::PullRequest(PullRequest {
///     subscription: "projects/p/subscriptions/s".into(),
///     max_messages: 100,
/// });
/// let framed = message.frame().expect("frame");
/// assert_eq!(Message::unframe(framed).expect("unframe"), message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StreamRequest(StreamRequest),
    StreamResponse(StreamResponse),
    PullRequest(PullRequest),
    PullResponse(PullResponse),
    Acknowledge(AcknowledgeRequest),
    ModifyAckDeadline(ModifyAckDeadlineRequest),
    OpOk,
    OpError(Status),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::StreamRequest(_) => TAG_STREAM_REQUEST,
            Self::StreamResponse(_) => TAG_STREAM_RESPONSE,
            Self::PullRequest(_) => TAG_PULL_REQUEST,
            Self::PullResponse(_) => TAG_PULL_RESPONSE,
            Self::Acknowledge(_) => TAG_ACKNOWLEDGE,
            Self::ModifyAckDeadline(_) => TAG_MODIFY_ACK_DEADLINE,
            Self::OpOk => TAG_OP_OK,
            Self::OpError(_) => TAG_OP_ERROR,
        }
    }

    /// Complete on-wire bytes: the preamble followed by the body.
    pub fn frame(&self) -> Result<Bytes> {
        let body = self.encode_body();
        if body.len() > u32::MAX as usize {
            return Err(Error::BodyTooLarge);
        }
        let mut preamble = [0u8; WireHeader::LEN];
        WireHeader {
            tag: self.tag(),
            body_len: body.len() as u32,
        }
        .write_to(&mut preamble);
        let mut framed = BytesMut::with_capacity(WireHeader::LEN + body.len());
        framed.extend_from_slice(&preamble);
        framed.extend_from_slice(&body);
        Ok(framed.freeze())
    }

    /// Decode one complete frame from a buffer. Stream readers that already
    /// parsed the preamble use [`Message::parse`] on the body instead.
    pub fn unframe(framed: Bytes) -> Result<Self> {
        if framed.len() < WireHeader::LEN {
            return Err(Error::Truncated);
        }
        let mut raw = [0u8; WireHeader::LEN];
        raw.copy_from_slice(&framed[..WireHeader::LEN]);
        let header = WireHeader::parse(&raw)?;
        let body_len = header.body_len as usize;
        if framed.len() < WireHeader::LEN + body_len {
            return Err(Error::Truncated);
        }
        Self::parse(
            header.tag,
            framed.slice(WireHeader::LEN..WireHeader::LEN + body_len),
        )
    }

    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(64);
        match self {
            Self::StreamRequest(request) => {
                put_string(&mut body, &request.subscription);
                put_u32(&mut body, request.stream_ack_deadline_seconds);
                put_u32(&mut body, request.ack_ids.len() as u32);
                for ack_id in &request.ack_ids {
                    put_string(&mut body, ack_id);
                }
                put_u32(&mut body, request.modify_deadlines.len() as u32);
                for change in &request.modify_deadlines {
                    put_string(&mut body, &change.ack_id);
                    put_u32(&mut body, change.extension_seconds);
                }
            }
            Self::StreamResponse(response) => put_messages(&mut body, &response.messages),
            Self::PullRequest(request) => {
                put_string(&mut body, &request.subscription);
                put_u32(&mut body, request.max_messages);
            }
            Self::PullResponse(response) => put_messages(&mut body, &response.messages),
            Self::Acknowledge(request) => {
                put_string(&mut body, &request.subscription);
                put_u32(&mut body, request.ack_ids.len() as u32);
                for ack_id in &request.ack_ids {
                    put_string(&mut body, ack_id);
                }
            }
            Self::ModifyAckDeadline(request) => {
                put_string(&mut body, &request.subscription);
                put_u32(&mut body, request.ack_deadline_seconds);
                put_u32(&mut body, request.ack_ids.len() as u32);
                for ack_id in &request.ack_ids {
                    put_string(&mut body, ack_id);
                }
            }
            Self::OpOk => {}
            Self::OpError(status) => {
                put_u32(&mut body, status.code.as_u32());
                put_string(&mut body, &status.message);
            }
        }
        body
    }

    /// Decode a body whose tag was taken from the preamble.
    pub fn parse(tag: u8, body: Bytes) -> Result<Self> {
        let mut reader = Reader::new(body);
        let message = match tag {
            TAG_STREAM_REQUEST => {
                let subscription = reader.string()?;
                let stream_ack_deadline_seconds = reader.u32()?;
                let ack_count = reader.u32()? as usize;
                let mut ack_ids = Vec::with_capacity(ack_count.min(1024));
                for _ in 0..ack_count {
                    ack_ids.push(reader.string()?);
                }
                let modify_count = reader.u32()? as usize;
                let mut modify_deadlines = Vec::with_capacity(modify_count.min(1024));
                for _ in 0..modify_count {
                    let ack_id = reader.string()?;
                    let extension_seconds = reader.u32()?;
                    modify_deadlines.push(DeadlineChange {
                        ack_id,
                        extension_seconds,
                    });
                }
                Self::StreamRequest(StreamRequest {
                    subscription,
                    stream_ack_deadline_seconds,
                    ack_ids,
                    modify_deadlines,
                })
            }
            TAG_STREAM_RESPONSE => Self::StreamResponse(StreamResponse {
                messages: read_messages(&mut reader)?,
            }),
            TAG_PULL_REQUEST => Self::PullRequest(PullRequest {
                subscription: reader.string()?,
                max_messages: reader.u32()?,
            }),
            TAG_PULL_RESPONSE => Self::PullResponse(PullResponse {
                messages: read_messages(&mut reader)?,
            }),
            TAG_ACKNOWLEDGE => {
                let subscription = reader.string()?;
                let count = reader.u32()? as usize;
                let mut ack_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    ack_ids.push(reader.string()?);
                }
                Self::Acknowledge(AcknowledgeRequest {
                    subscription,
                    ack_ids,
                })
            }
            TAG_MODIFY_ACK_DEADLINE => {
                let subscription = reader.string()?;
                let ack_deadline_seconds = reader.u32()?;
                let count = reader.u32()? as usize;
                let mut ack_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    ack_ids.push(reader.string()?);
                }
                Self::ModifyAckDeadline(ModifyAckDeadlineRequest {
                    subscription,
                    ack_deadline_seconds,
                    ack_ids,
                })
            }
            TAG_OP_OK => Self::OpOk,
            TAG_OP_ERROR => {
                let code = StatusCode::from_u32(reader.u32()?);
                let message = reader.string()?;
                Self::OpError(Status { code, message })
            }
            other => return Err(Error::UnknownTag(other)),
        };
        Ok(message)
    }
}

fn put_u32(body: &mut BytesMut, value: u32) {
    body.extend_from_slice(&value.to_be_bytes());
}

fn put_string(body: &mut BytesMut, value: &str) {
    put_u32(body, value.len() as u32);
    body.extend_from_slice(value.as_bytes());
}

fn put_messages(body: &mut BytesMut, messages: &[ReceivedMessage]) {
    put_u32(body, messages.len() as u32);
    for message in messages {
        put_string(body, &message.ack_id);
        put_u32(body, message.payload.len() as u32);
        body.extend_from_slice(&message.payload);
    }
}

fn read_messages(reader: &mut Reader) -> Result<Vec<ReceivedMessage>> {
    let count = reader.u32()? as usize;
    let mut messages = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let ack_id = reader.string()?;
        let payload = reader.bytes()?;
        messages.push(ReceivedMessage { ack_id, payload });
    }
    Ok(messages)
}

// Checked cursor over a message body; zero-copy for byte fields.
struct Reader {
    body: Bytes,
}

impl Reader {
    fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn u32(&mut self) -> Result<u32> {
        if self.body.len() < 4 {
            return Err(Error::Truncated);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.body[..4]);
        self.body = self.body.slice(4..);
        Ok(u32::from_be_bytes(raw))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        if self.body.len() < len {
            return Err(Error::Truncated);
        }
        let value = self.body.slice(..len);
        self.body = self.body.slice(len..);
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)
    }
}
