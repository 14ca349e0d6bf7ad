// Wire protocol for the subscriber RPC surface.
//
// Every message travels as one frame: a fixed preamble carrying the message
// tag and body length, followed by the tag-specific body. There is no
// generic payload container; the preamble and the body codec in `message`
// are two halves of the same format.
mod message;
mod status;

pub use message::{
    AcknowledgeRequest, DeadlineChange, Message, ModifyAckDeadlineRequest, PullRequest,
    PullResponse, ReceivedMessage, StreamRequest, StreamResponse,
};
pub use status::{Status, StatusCode};

pub const WIRE_MAGIC: [u8; 4] = *b"TTHR";
pub const WIRE_VERSION: u8 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad wire magic")]
    BadMagic,
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("message body exceeds the length field")]
    BodyTooLarge,
    #[error("truncated message")]
    Truncated,
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Preamble in front of every message body.
///
/// Layout, in order: the 4 magic bytes, the wire version, the message tag,
/// and the big-endian body length. Stream readers parse this first so they
/// can size the body read (and refuse it) before touching the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub tag: u8,
    pub body_len: u32,
}

impl WireHeader {
    pub const LEN: usize = 10;

    pub fn parse(raw: &[u8; Self::LEN]) -> Result<Self> {
        if raw[0..4] != WIRE_MAGIC {
            return Err(Error::BadMagic);
        }
        if raw[4] != WIRE_VERSION {
            return Err(Error::UnsupportedVersion(raw[4]));
        }
        Ok(Self {
            tag: raw[5],
            body_len: u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]),
        })
    }

    pub fn write_to(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&WIRE_MAGIC);
        out[4] = WIRE_VERSION;
        out[5] = self.tag;
        out[6..10].copy_from_slice(&self.body_len.to_be_bytes());
    }
}
