// Streaming strategy: one bidirectional stream per connection, reopened with
// bounded backoff on retryable failures.
//
// Intake is reader-driven: the source hands over one response per `recv`
// call, so the next server frame is only requested once the previous one was
// dispatched. A separate writer task owns the sink and drains the ack pump's
// operation channel, so acks keep flowing while intake is blocked on flow
// control.
use std::sync::Arc;
use tether_transport::{StreamSink, StreamSource, SubscriberChannel};
use tether_wire::{Status, StreamRequest};
use tokio::sync::{mpsc, watch};

use crate::connection::{
    ConnectionCommand, ConnectionContext, ConnectionEvent, ConnectionState, ErrorDisposition,
    INITIAL_CHANNEL_RECONNECT_BACKOFF, classify_error, dispatch_messages, next_backoff,
    sleep_or_cancel,
};
use crate::pump::AckBatch;

enum WriterCommand {
    Sink(Box<dyn StreamSink>),
    UpdateDeadline(u32),
    StreamDown,
    Shutdown,
}

enum StreamOutcome {
    Cancelled,
    CleanClose,
    Errored(Status),
}

pub(crate) async fn run_streaming_connection(
    ctx: ConnectionContext,
    channel: Arc<dyn SubscriberChannel>,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    ops_rx: mpsc::UnboundedReceiver<AckBatch>,
    mut cancel: watch::Receiver<bool>,
) {
    let _ = ctx.state_tx.send(ConnectionState::Starting);
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_stream_writer(ops_rx, writer_rx));
    let mut backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
    let mut failure: Option<Status> = None;

    'retry: while !*cancel.borrow() {
        let initial = StreamRequest::initial(ctx.subscription.clone(), ctx.pump.stream_deadline());
        let opened = tokio::select! {
            result = channel.open_stream(initial) => result,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break 'retry;
                }
                continue 'retry;
            }
        };
        let status = match opened {
            Ok((sink, source)) => {
                // Every successful open resets the reconnect backoff.
                backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
                let _ = writer_tx.send(WriterCommand::Sink(sink));
                let _ = ctx.state_tx.send(ConnectionState::Running);
                tracing::debug!(
                    subscription = %ctx.subscription,
                    deadline = ctx.pump.stream_deadline(),
                    "subscriber stream open"
                );
                let outcome =
                    drive_stream(&ctx, source, &mut commands, &mut cancel, &writer_tx).await;
                let _ = writer_tx.send(WriterCommand::StreamDown);
                match outcome {
                    StreamOutcome::Cancelled => break 'retry,
                    StreamOutcome::CleanClose => {
                        // Server-side rotation; reopen without waiting.
                        metrics::counter!("tether_sub_stream_reconnects_total").increment(1);
                        tracing::debug!("subscriber stream completed; reopening");
                        continue 'retry;
                    }
                    StreamOutcome::Errored(status) => status,
                }
            }
            Err(status) => status,
        };

        match classify_error(&ctx.config, &status) {
            ErrorDisposition::Retry => {
                metrics::counter!("tether_sub_stream_reconnects_total").increment(1);
                tracing::warn!(%status, backoff = ?backoff, "retryable stream error; reconnecting");
                let _ = ctx.state_tx.send(ConnectionState::Starting);
                if sleep_or_cancel(backoff, &mut cancel).await {
                    break 'retry;
                }
                backoff = next_backoff(backoff);
            }
            ErrorDisposition::Fallback => {
                tracing::info!(%status, "streaming pull not supported; requesting fallback");
                let _ = ctx.events.send(ConnectionEvent::StreamingUnimplemented);
                break 'retry;
            }
            ErrorDisposition::Fatal => {
                tracing::error!(%status, "fatal stream error; connection failed");
                let _ = ctx.state_tx.send(ConnectionState::Failed);
                let _ = ctx.events.send(ConnectionEvent::Fatal(status.clone()));
                failure = Some(status);
                break 'retry;
            }
        }
    }

    // Best-effort final flush before the sink closes, then settle the state.
    if failure.is_none() {
        let _ = ctx.state_tx.send(ConnectionState::Stopping);
    }
    ctx.pump.shutdown();
    let _ = writer_tx.send(WriterCommand::Shutdown);
    let _ = writer.await;
    if failure.is_none() {
        let _ = ctx.state_tx.send(ConnectionState::Terminated);
    }
}

async fn drive_stream(
    ctx: &ConnectionContext,
    mut source: Box<dyn StreamSource>,
    commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel: &mut watch::Receiver<bool>,
    writer_tx: &mpsc::UnboundedSender<WriterCommand>,
) -> StreamOutcome {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return StreamOutcome::Cancelled;
                }
            }
            command = commands.recv() => {
                if let Some(ConnectionCommand::UpdateStreamAckDeadline(seconds)) = command {
                    ctx.pump.set_stream_deadline(seconds);
                    let _ = writer_tx.send(WriterCommand::UpdateDeadline(seconds));
                }
            }
            response = source.recv() => match response {
                Ok(Some(response)) => {
                    if dispatch_messages(ctx, response.messages).await.is_err() {
                        // Flow controller closed: shutdown is in progress.
                        return StreamOutcome::Cancelled;
                    }
                    // Looping back requests exactly one more frame.
                }
                Ok(None) => return StreamOutcome::CleanClose,
                Err(status) => return StreamOutcome::Errored(status),
            }
        }
    }
}

async fn run_stream_writer(
    mut ops_rx: mpsc::UnboundedReceiver<AckBatch>,
    mut writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut sink: Option<Box<dyn StreamSink>> = None;
    let mut ops_open = true;
    loop {
        tokio::select! {
            command = writer_rx.recv() => match command {
                Some(WriterCommand::Sink(new_sink)) => sink = Some(new_sink),
                Some(WriterCommand::UpdateDeadline(seconds)) => {
                    if let Some(active) = sink.as_mut()
                        && let Err(status) = active
                            .send(StreamRequest::deadline_update(seconds))
                            .await
                    {
                        tracing::debug!(%status, "deadline update failed; stream will reopen");
                        sink = None;
                    }
                }
                Some(WriterCommand::StreamDown) => sink = None,
                Some(WriterCommand::Shutdown) | None => break,
            },
            batch = ops_rx.recv(), if ops_open => match batch {
                Some(batch) => send_batch(&mut sink, batch).await,
                None => ops_open = false,
            },
        }
    }
    // Drain whatever the pump flushed during shutdown, then half-close.
    while let Ok(batch) = ops_rx.try_recv() {
        send_batch(&mut sink, batch).await;
    }
    if let Some(mut active) = sink.take() {
        let _ = active.close().await;
    }
}

async fn send_batch(sink: &mut Option<Box<dyn StreamSink>>, batch: AckBatch) {
    let Some(active) = sink.as_mut() else {
        // No live stream: the server redelivers anything left unacked.
        tracing::debug!(
            acks = batch.acks.len(),
            modifies = batch.modify_deadlines.len(),
            "no active stream; dropping ack batch"
        );
        return;
    };
    let request = StreamRequest::ack_batch(batch.acks, batch.modify_deadlines);
    if let Err(status) = active.send(request).await {
        tracing::debug!(%status, "ack batch send failed; dropping stream sink");
        *sink = None;
    }
}
