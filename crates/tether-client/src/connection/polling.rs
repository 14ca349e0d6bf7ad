// Polling strategy: repeated unary pulls on a single connection, with acks
// and deadline changes sent as unary calls from the ack pump's channel.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::SubscriberChannel;
use tether_wire::{AcknowledgeRequest, ModifyAckDeadlineRequest, PullRequest, Status};
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{
    ConnectionCommand, ConnectionContext, ConnectionEvent, ConnectionState, ErrorDisposition,
    INITIAL_CHANNEL_RECONNECT_BACKOFF, classify_error, dispatch_messages, next_backoff,
    sleep_or_cancel,
};
use crate::pump::AckBatch;

const DEFAULT_PULL_MAX_MESSAGES: u32 = 1000;
// Breather after a pull that returned nothing.
const EMPTY_PULL_WAIT: Duration = Duration::from_millis(100);

pub(crate) async fn run_polling_connection(
    ctx: ConnectionContext,
    channel: Arc<dyn SubscriberChannel>,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    ops_rx: mpsc::UnboundedReceiver<AckBatch>,
    mut cancel: watch::Receiver<bool>,
) {
    let _ = ctx.state_tx.send(ConnectionState::Starting);
    let (flusher_stop_tx, flusher_stop_rx) = oneshot::channel();
    let flusher = tokio::spawn(run_unary_flusher(
        Arc::clone(&channel),
        ctx.subscription.clone(),
        ops_rx,
        flusher_stop_rx,
    ));
    let _ = ctx.state_tx.send(ConnectionState::Running);
    let mut backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
    let mut failure: Option<Status> = None;

    'poll: while !*cancel.borrow() {
        // Deadline re-tunes only reseed the pump; unary modify calls carry
        // explicit per-message extensions.
        while let Ok(ConnectionCommand::UpdateStreamAckDeadline(seconds)) = commands.try_recv() {
            ctx.pump.set_stream_deadline(seconds);
        }

        let request = PullRequest {
            subscription: ctx.subscription.clone(),
            max_messages: DEFAULT_PULL_MAX_MESSAGES,
        };
        let pulled = tokio::select! {
            result = channel.pull(request) => result,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break 'poll;
                }
                continue 'poll;
            }
        };
        match pulled {
            Ok(response) => {
                backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
                let _ = ctx.state_tx.send(ConnectionState::Running);
                if response.messages.is_empty() {
                    if sleep_or_cancel(EMPTY_PULL_WAIT, &mut cancel).await {
                        break 'poll;
                    }
                } else if dispatch_messages(&ctx, response.messages).await.is_err() {
                    break 'poll;
                }
            }
            Err(status) => match classify_error(&ctx.config, &status) {
                ErrorDisposition::Retry => {
                    tracing::warn!(%status, backoff = ?backoff, "retryable pull error");
                    let _ = ctx.state_tx.send(ConnectionState::Starting);
                    if sleep_or_cancel(backoff, &mut cancel).await {
                        break 'poll;
                    }
                    backoff = next_backoff(backoff);
                }
                ErrorDisposition::Fallback | ErrorDisposition::Fatal => {
                    tracing::error!(%status, "fatal pull error; connection failed");
                    let _ = ctx.state_tx.send(ConnectionState::Failed);
                    let _ = ctx.events.send(ConnectionEvent::Fatal(status.clone()));
                    failure = Some(status);
                    break 'poll;
                }
            },
        }
    }

    if failure.is_none() {
        let _ = ctx.state_tx.send(ConnectionState::Stopping);
    }
    ctx.pump.shutdown();
    let _ = flusher_stop_tx.send(());
    let _ = flusher.await;
    if failure.is_none() {
        let _ = ctx.state_tx.send(ConnectionState::Terminated);
    }
}

async fn run_unary_flusher(
    channel: Arc<dyn SubscriberChannel>,
    subscription: String,
    mut ops_rx: mpsc::UnboundedReceiver<AckBatch>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            batch = ops_rx.recv() => match batch {
                Some(batch) => flush_unary(channel.as_ref(), &subscription, batch).await,
                None => break,
            },
        }
    }
    // The pump's shutdown flush is already queued; drain it best-effort.
    while let Ok(batch) = ops_rx.try_recv() {
        flush_unary(channel.as_ref(), &subscription, batch).await;
    }
}

async fn flush_unary(channel: &dyn SubscriberChannel, subscription: &str, batch: AckBatch) {
    // Deadline changes go out before acks, grouped per extension value.
    let mut by_extension: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for change in batch.modify_deadlines {
        by_extension
            .entry(change.extension_seconds)
            .or_default()
            .push(change.ack_id);
    }
    for (ack_deadline_seconds, ack_ids) in by_extension {
        let request = ModifyAckDeadlineRequest {
            subscription: subscription.to_string(),
            ack_deadline_seconds,
            ack_ids,
        };
        if let Err(status) = channel.modify_ack_deadline(request).await {
            tracing::warn!(%status, "modify-ack-deadline failed; leases may lapse");
        }
    }
    if !batch.acks.is_empty() {
        let request = AcknowledgeRequest {
            subscription: subscription.to_string(),
            ack_ids: batch.acks,
        };
        if let Err(status) = channel.acknowledge(request).await {
            tracing::warn!(%status, "acknowledge failed; messages will be redelivered");
        }
    }
}
