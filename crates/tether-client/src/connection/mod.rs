// Connection lifecycle skeleton shared by the streaming and polling
// strategies: state reporting, error classification, bounded reconnect
// backoff, and the per-message dispatch path.
pub(crate) mod polling;
pub(crate) mod streaming;

use std::sync::Arc;
use std::time::Duration;
use tether_wire::{ReceivedMessage, Status, StatusCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{PullMode, SubscriberConfig};
use crate::distribution::LatencyDistribution;
use crate::flow::{FlowController, FlowError};
use crate::handler::{MessageHandler, Reply, ReplyOutcome};
use crate::pump::AckPump;

pub(crate) const INITIAL_CHANNEL_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const MAX_CHANNEL_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

pub(crate) enum ConnectionCommand {
    UpdateStreamAckDeadline(u32),
}

pub(crate) enum ConnectionEvent {
    /// Non-retryable transport failure; the supervisor stops everything.
    Fatal(Status),
    /// The server does not implement streaming pull; fall back to polling.
    StreamingUnimplemented,
}

/// Everything one connection task needs besides its transport handles.
pub(crate) struct ConnectionContext {
    pub subscription: String,
    pub config: Arc<SubscriberConfig>,
    pub handler: Arc<dyn MessageHandler>,
    pub flow: Arc<FlowController>,
    pub distribution: Arc<LatencyDistribution>,
    pub pump: AckPump,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub state_tx: watch::Sender<ConnectionState>,
}

pub(crate) struct ConnectionHandle {
    pub command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    pub cancel_tx: watch::Sender<bool>,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub task: JoinHandle<()>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_connection(
    mode: PullMode,
    config: Arc<SubscriberConfig>,
    stream_ack_deadline_seconds: u32,
    channel: Arc<dyn tether_transport::SubscriberChannel>,
    handler: Arc<dyn MessageHandler>,
    flow: Arc<FlowController>,
    distribution: Arc<LatencyDistribution>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(ConnectionState::New);
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let pump = AckPump::new(
        Arc::clone(&distribution),
        ops_tx,
        stream_ack_deadline_seconds,
        config.ack_expiration_padding,
    );
    let ctx = ConnectionContext {
        subscription: config.subscription.clone(),
        config,
        handler,
        flow,
        distribution,
        pump,
        events,
        state_tx,
    };
    let task = match mode {
        PullMode::Streaming => tokio::spawn(streaming::run_streaming_connection(
            ctx, channel, command_rx, ops_rx, cancel_rx,
        )),
        PullMode::Polling => tokio::spawn(polling::run_polling_connection(
            ctx, channel, command_rx, ops_rx, cancel_rx,
        )),
    };
    ConnectionHandle {
        command_tx,
        cancel_tx,
        state_rx,
        task,
    }
}

/// What the retry loop should do with a stream error.
pub(crate) enum ErrorDisposition {
    Retry,
    Fallback,
    Fatal,
}

pub(crate) fn classify_error(config: &SubscriberConfig, status: &Status) -> ErrorDisposition {
    if config.is_retryable(status.code) {
        ErrorDisposition::Retry
    } else if status.code == StatusCode::Unimplemented {
        ErrorDisposition::Fallback
    } else {
        ErrorDisposition::Fatal
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_CHANNEL_RECONNECT_BACKOFF)
}

/// Sleep that yields early on cancel. Returns true when cancelled.
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
    }
}

/// Deliver one response's messages: reserve flow, register with the pump,
/// then hand each message to the user handler on its own task. The handler
/// never runs under a pump or connection lock.
///
/// Blocks while the flow controller is saturated, which is what throttles
/// intake. An error means the controller was closed for shutdown.
pub(crate) async fn dispatch_messages(
    ctx: &ConnectionContext,
    messages: Vec<ReceivedMessage>,
) -> Result<(), FlowError> {
    for message in messages {
        let reservation = ctx.flow.reserve(1, message.payload.len() as u64).await?;
        metrics::counter!("tether_sub_messages_received_total").increment(1);
        ctx.pump.on_message_received(&message.ack_id);

        let pump = ctx.pump.clone();
        let distribution = Arc::clone(&ctx.distribution);
        let handler = Arc::clone(&ctx.handler);
        tokio::spawn(async move {
            let received_at = Instant::now();
            let ack_id = message.ack_id.clone();
            let (reply, outcome) = Reply::pair();
            handler.receive(message, reply);
            match outcome.await {
                Ok(ReplyOutcome::Ack) => pump.on_ack(&ack_id),
                Ok(ReplyOutcome::Nack) => pump.on_nack(&ack_id),
                Ok(ReplyOutcome::Error(cause)) => {
                    tracing::warn!(ack_id = %ack_id, error = %cause, "handler failed; nacking");
                    pump.on_nack(&ack_id);
                }
                Err(_) => {
                    tracing::warn!(ack_id = %ack_id, "handler dropped its reply; nacking");
                    pump.on_nack(&ack_id);
                }
            }
            distribution.record(received_at.elapsed().as_secs());
            drop(reservation);
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_millis(200));
        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_CHANNEL_RECONNECT_BACKOFF);
    }

    #[test]
    fn unimplemented_prefers_fallback_over_fatal() {
        let config = SubscriberConfig::new("projects/p/subscriptions/s");
        assert!(matches!(
            classify_error(&config, &Status::unimplemented("no streaming")),
            ErrorDisposition::Fallback
        ));
        assert!(matches!(
            classify_error(&config, &Status::invalid_argument("bad")),
            ErrorDisposition::Fatal
        ));
        assert!(matches!(
            classify_error(&config, &Status::internal("boom")),
            ErrorDisposition::Retry
        ));
    }
}
