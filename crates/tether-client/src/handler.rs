// User-facing message handler seam and the one-shot reply handle.
use tether_wire::ReceivedMessage;
use tokio::sync::oneshot;

pub(crate) enum ReplyOutcome {
    Ack,
    Nack,
    Error(anyhow::Error),
}

/// One-shot completion handle for a delivered message.
///
/// Exactly one of [`ack`](Reply::ack), [`nack`](Reply::nack), or
/// [`error`](Reply::error) may be called. Dropping the handle unresolved
/// counts as a handler failure and the message is nacked.
pub struct Reply {
    tx: oneshot::Sender<ReplyOutcome>,
}

impl Reply {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<ReplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// The message was processed; the server may delete it.
    pub fn ack(self) {
        let _ = self.tx.send(ReplyOutcome::Ack);
    }

    /// The message was not processed; the server redelivers it immediately.
    pub fn nack(self) {
        let _ = self.tx.send(ReplyOutcome::Nack);
    }

    /// Processing failed; logged by the connection and treated as a nack.
    pub fn error(self, cause: anyhow::Error) {
        let _ = self.tx.send(ReplyOutcome::Error(cause));
    }
}

/// Application callback invoked once per received copy of a message.
///
/// Duplicate deliveries across reconnects are separate receives and the
/// handler must tolerate them. Handlers may hold the [`Reply`] for as long
/// as the work takes; the connection keeps the message leased meanwhile.
pub trait MessageHandler: Send + Sync + 'static {
    fn receive(&self, message: ReceivedMessage, reply: Reply);
}

impl<F> MessageHandler for F
where
    F: Fn(ReceivedMessage, Reply) + Send + Sync + 'static,
{
    fn receive(&self, message: ReceivedMessage, reply: Reply) {
        self(message, reply)
    }
}
