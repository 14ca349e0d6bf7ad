// Message IO over QUIC streams: one preamble-framed message per read/write.
use anyhow::{Context, Result};
use bytes::BytesMut;
use quinn::{ReadExactError, RecvStream, SendStream};
use tether_wire::{Message, WireHeader};

/// Read the next message, or `None` once the peer half-closes cleanly.
///
/// The body cap is enforced from the preamble, before any allocation, so a
/// misbehaving peer cannot make us reserve arbitrary memory.
pub async fn read_message(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_body_bytes: usize,
) -> Result<Option<Message>> {
    let mut preamble = [0u8; WireHeader::LEN];
    match recv.read_exact(&mut preamble).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }
    let header = WireHeader::parse(&preamble).context("parse message preamble")?;
    let body_len = header.body_len as usize;
    if body_len > max_body_bytes {
        anyhow::bail!("message body of {body_len} bytes exceeds the {max_body_bytes} byte cap");
    }

    // Reuse the scratch buffer to avoid per-message allocations.
    scratch.clear();
    scratch.resize(body_len, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read message body")?;
    let message =
        Message::parse(header.tag, scratch.split().freeze()).context("decode message body")?;
    Ok(Some(message))
}

/// Frame one message and flush it to the stream.
pub async fn write_message(send: &mut SendStream, message: &Message) -> Result<()> {
    let framed = message.frame().context("encode message")?;
    send.write_all(&framed).await.context("write message")?;
    Ok(())
}
