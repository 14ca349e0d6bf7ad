// Ack pump: in-flight bookkeeping, batched ack emission, deadline renewals.
//
// The pump never talks to the transport directly; drained batches go into an
// unbounded channel owned by the connection, so a flush can never fail the
// pump. User code is never invoked under the pump lock.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_wire::DeadlineChange;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::distribution::LatencyDistribution;

/// How long freshly enqueued acks wait for companions before a flush.
pub(crate) const PENDING_ACKS_SEND_DELAY: Duration = Duration::from_millis(100);
/// Cap on combined ack + modify entries per outgoing request.
pub(crate) const MAX_PER_REQUEST_CHANGES: usize = 10_000;
/// First renewal granted when the latency distribution is still empty.
const INITIAL_ACK_DEADLINE_EXTENSION_SECONDS: u32 = 2;
const MAX_ACK_DEADLINE_EXTENSION_SECONDS: u32 = 600;
const EXTENSION_PERCENTILE: f64 = 0.99;

/// One drained batch handed to the connection for transmission.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct AckBatch {
    pub acks: Vec<String>,
    /// Extensions and nacks (extension 0), emitted before the acks.
    pub modify_deadlines: Vec<DeadlineChange>,
}

impl AckBatch {
    pub(crate) fn change_count(&self) -> usize {
        self.acks.len() + self.modify_deadlines.len()
    }
}

struct InFlight {
    received_at: Instant,
    expiration: Instant,
    // None until the first renewal; then the pre-doubled next grant.
    next_extension_seconds: Option<u32>,
}

struct ExtensionAlarm {
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PumpState {
    pending_acks: Vec<String>,
    pending_nacks: Vec<String>,
    pending_extensions: HashMap<String, u32>,
    in_flight: HashMap<String, InFlight>,
    ack_alarm: Option<JoinHandle<()>>,
    extension_alarm: Option<ExtensionAlarm>,
    shut_down: bool,
}

struct PumpInner {
    state: Mutex<PumpState>,
    ops_tx: mpsc::UnboundedSender<AckBatch>,
    distribution: Arc<LatencyDistribution>,
    stream_deadline_seconds: AtomicU32,
    padding: Duration,
}

#[derive(Clone)]
pub(crate) struct AckPump {
    inner: Arc<PumpInner>,
}

impl AckPump {
    pub(crate) fn new(
        distribution: Arc<LatencyDistribution>,
        ops_tx: mpsc::UnboundedSender<AckBatch>,
        stream_deadline_seconds: u32,
        padding: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                state: Mutex::new(PumpState::default()),
                ops_tx,
                distribution,
                stream_deadline_seconds: AtomicU32::new(stream_deadline_seconds),
                padding,
            }),
        }
    }

    pub(crate) fn stream_deadline(&self) -> u32 {
        self.inner.stream_deadline_seconds.load(Ordering::Relaxed)
    }

    /// Reseed the deadline used for newly received messages.
    pub(crate) fn set_stream_deadline(&self, seconds: u32) {
        self.inner
            .stream_deadline_seconds
            .store(seconds, Ordering::Relaxed);
    }

    pub(crate) fn on_message_received(&self, ack_id: &str) {
        let now = Instant::now();
        let deadline = Duration::from_secs(self.stream_deadline() as u64);
        let mut state = self.inner.state.lock().expect("pump lock");
        if state.shut_down {
            return;
        }
        let expiration = now + deadline;
        state.in_flight.insert(
            ack_id.to_string(),
            InFlight {
                received_at: now,
                expiration,
                next_extension_seconds: None,
            },
        );
        metrics::gauge!("tether_sub_in_flight").set(state.in_flight.len() as f64);
        self.arm_extension_alarm_locked(&mut state, expiration - self.inner.padding);
    }

    pub(crate) fn on_ack(&self, ack_id: &str) {
        self.on_terminal(ack_id, true);
    }

    pub(crate) fn on_nack(&self, ack_id: &str) {
        self.on_terminal(ack_id, false);
    }

    fn on_terminal(&self, ack_id: &str, ack: bool) {
        let mut state = self.inner.state.lock().expect("pump lock");
        if state.shut_down {
            return;
        }
        state.in_flight.remove(ack_id);
        // The terminal op supersedes any queued extension for this id.
        state.pending_extensions.remove(ack_id);
        if ack {
            state.pending_acks.push(ack_id.to_string());
            metrics::counter!("tether_sub_acks_total").increment(1);
        } else {
            state.pending_nacks.push(ack_id.to_string());
            metrics::counter!("tether_sub_nacks_total").increment(1);
        }
        metrics::gauge!("tether_sub_in_flight").set(state.in_flight.len() as f64);
        self.arm_ack_alarm_locked(&mut state);
    }

    fn arm_ack_alarm_locked(&self, state: &mut PumpState) {
        if state.shut_down || state.ack_alarm.is_some() {
            return;
        }
        let pump = self.clone();
        state.ack_alarm = Some(tokio::spawn(async move {
            tokio::time::sleep(PENDING_ACKS_SEND_DELAY).await;
            {
                let mut state = pump.inner.state.lock().expect("pump lock");
                state.ack_alarm = None;
            }
            pump.flush();
        }));
    }

    fn arm_extension_alarm_locked(&self, state: &mut PumpState, target: Instant) {
        if state.shut_down {
            return;
        }
        if let Some(alarm) = &state.extension_alarm {
            if alarm.deadline <= target {
                return;
            }
            alarm.handle.abort();
        }
        let pump = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(target).await;
            pump.on_extension_alarm();
        });
        state.extension_alarm = Some(ExtensionAlarm {
            deadline: target,
            handle,
        });
    }

    // Grant every in-flight message its next lease and re-arm for the
    // earliest renewal. Runs on the alarm task.
    fn on_extension_alarm(&self) {
        let granted = {
            let mut state = self.inner.state.lock().expect("pump lock");
            state.extension_alarm = None;
            if state.shut_down || state.in_flight.is_empty() {
                return;
            }
            let now = Instant::now();
            let seed = (self.inner.distribution.percentile(EXTENSION_PERCENTILE) as u32)
                .max(INITIAL_ACK_DEADLINE_EXTENSION_SECONDS);
            let mut earliest: Option<Instant> = None;
            let mut granted = 0usize;
            let state = &mut *state;
            for (ack_id, record) in state.in_flight.iter_mut() {
                let extension = record
                    .next_extension_seconds
                    .unwrap_or(seed)
                    .min(MAX_ACK_DEADLINE_EXTENSION_SECONDS);
                record.expiration = now + Duration::from_secs(extension as u64);
                record.next_extension_seconds =
                    Some((extension * 2).min(MAX_ACK_DEADLINE_EXTENSION_SECONDS));
                tracing::trace!(
                    ack_id = %ack_id,
                    extension,
                    held_for = ?now.duration_since(record.received_at),
                    "extending message lease"
                );
                state.pending_extensions.insert(ack_id.clone(), extension);
                granted += 1;
                earliest = Some(match earliest {
                    Some(current) if current <= record.expiration => current,
                    _ => record.expiration,
                });
            }
            if let Some(earliest) = earliest {
                self.arm_extension_alarm_locked(state, earliest - self.inner.padding);
            }
            granted
        };
        if granted > 0 {
            // Renewals go out immediately; waiting out the ack-send delay
            // would eat into the very lease being extended.
            self.flush();
        }
    }

    /// Drain everything pending into bounded batches and hand them to the
    /// connection. Errors never propagate; the channel outlives the streams.
    pub(crate) fn flush(&self) {
        let batches = {
            let mut state = self.inner.state.lock().expect("pump lock");
            if let Some(alarm) = state.ack_alarm.take() {
                alarm.abort();
            }
            if state.pending_acks.is_empty()
                && state.pending_nacks.is_empty()
                && state.pending_extensions.is_empty()
            {
                return;
            }
            let acks = std::mem::take(&mut state.pending_acks);
            let nacks = std::mem::take(&mut state.pending_nacks);
            let mut modify_deadlines: Vec<DeadlineChange> = state
                .pending_extensions
                .drain()
                .map(|(ack_id, extension_seconds)| DeadlineChange {
                    ack_id,
                    extension_seconds,
                })
                .collect();
            modify_deadlines.extend(nacks.into_iter().map(|ack_id| DeadlineChange {
                ack_id,
                extension_seconds: 0,
            }));
            chunk_batches(modify_deadlines, acks)
        };
        for batch in batches {
            metrics::counter!("tether_sub_batches_flushed_total").increment(1);
            if self.inner.ops_tx.send(batch).is_err() {
                tracing::debug!("ack operation channel closed; dropping batch");
            }
        }
    }

    /// Cancel the alarms, drop any late operations, and flush what is queued.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("pump lock");
            state.shut_down = true;
            if let Some(alarm) = state.ack_alarm.take() {
                alarm.abort();
            }
            if let Some(alarm) = state.extension_alarm.take() {
                alarm.handle.abort();
            }
        }
        self.flush();
    }
}

// Fill each request with modify entries first, then acks, never exceeding the
// combined per-request cap.
fn chunk_batches(mut modify_deadlines: Vec<DeadlineChange>, mut acks: Vec<String>) -> Vec<AckBatch> {
    let mut batches = Vec::new();
    while !modify_deadlines.is_empty() || !acks.is_empty() {
        let modify_take = modify_deadlines.len().min(MAX_PER_REQUEST_CHANGES);
        let batch_modify: Vec<DeadlineChange> = modify_deadlines.drain(..modify_take).collect();
        let ack_take = acks.len().min(MAX_PER_REQUEST_CHANGES - batch_modify.len());
        let batch_acks: Vec<String> = acks.drain(..ack_take).collect();
        batches.push(AckBatch {
            acks: batch_acks,
            modify_deadlines: batch_modify,
        });
    }
    batches
}
