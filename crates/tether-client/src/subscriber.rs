//! Subscriber supervisor: owns the connection fan-out, the shared latency
//! distribution and flow controller, and the ack-deadline tuning loop.
//!
//! # Design notes
//! Streaming opens `cores x channels_per_core` connections, each on its own
//! transport channel so per-channel stream limits never serialise traffic.
//! A fatal failure on any connection fails the whole subscriber; a server
//! without streaming support downgrades the fan-out to one polling
//! connection.
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_transport::ChannelFactory;
use tether_wire::Status;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{
    MAX_STREAM_ACK_DEADLINE_SECONDS, MIN_STREAM_ACK_DEADLINE_SECONDS, PullMode, SubscriberConfig,
};
use crate::connection::{
    ConnectionCommand, ConnectionEvent, ConnectionHandle, ConnectionState, spawn_connection,
};
use crate::distribution::LatencyDistribution;
use crate::flow::FlowController;
use crate::handler::MessageHandler;

const ACK_DEADLINE_UPDATE_PERIOD: Duration = Duration::from_secs(60);
const ACK_DEADLINE_PERCENTILE: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

struct Shared {
    config: Arc<SubscriberConfig>,
    factory: Arc<dyn ChannelFactory>,
    handler: Arc<dyn MessageHandler>,
    distribution: Arc<LatencyDistribution>,
    flow: Arc<FlowController>,
    state_tx: watch::Sender<SubscriberState>,
    // Stops the monitor and tuning tasks; connections have their own cancels.
    cancel_tx: watch::Sender<bool>,
    connections: Mutex<Vec<ConnectionHandle>>,
    failure: Mutex<Option<Status>>,
    current_deadline: AtomicU32,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Running subscriber. Dropping it does not stop the connections; call
/// [`stop`](Subscriber::stop).
pub struct Subscriber {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SubscriberState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    tuner: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Subscriber {
    /// Validate the configuration, open one transport channel per
    /// connection, and start pulling. Returns once every connection reached
    /// a settled state; fatal failures after that surface through
    /// [`state`](Subscriber::state) and [`failure_cause`](Subscriber::failure_cause).
    pub async fn start(
        config: SubscriberConfig,
        factory: Arc<dyn ChannelFactory>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let flow = Arc::new(FlowController::new(config.flow_control.clone())?);
        let distribution = Arc::new(LatencyDistribution::new());
        let (state_tx, state_rx) = watch::channel(SubscriberState::Starting);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config: Arc::clone(&config),
            factory,
            handler,
            distribution,
            flow,
            state_tx,
            cancel_tx,
            connections: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            current_deadline: AtomicU32::new(config.stream_ack_deadline_seconds),
            events_tx,
        });

        let connection_count = match config.pull_mode {
            PullMode::Streaming => available_cores() * config.channels_per_core,
            PullMode::Polling => 1,
        };
        tracing::info!(
            subscription = %config.subscription,
            connections = connection_count,
            mode = ?config.pull_mode,
            "starting subscriber"
        );

        // One channel per connection, dialed in parallel.
        let channels = futures::future::join_all(
            (0..connection_count).map(|_| shared.factory.open_channel()),
        )
        .await;
        let mut handles = Vec::with_capacity(connection_count);
        for channel in channels {
            let channel = channel
                .map_err(anyhow::Error::from)
                .context("open subscriber channel")?;
            handles.push(spawn_connection(
                config.pull_mode,
                Arc::clone(&config),
                config.stream_ack_deadline_seconds,
                channel,
                Arc::clone(&shared.handler),
                Arc::clone(&shared.flow),
                Arc::clone(&shared.distribution),
                shared.events_tx.clone(),
            ));
        }
        let state_receivers: Vec<_> = handles.iter().map(|h| h.state_rx.clone()).collect();
        *shared.connections.lock().expect("connections lock") = handles;

        let monitor = tokio::spawn(run_monitor(
            Arc::clone(&shared),
            events_rx,
            cancel_rx.clone(),
        ));
        let tuner = tokio::spawn(run_deadline_tuner(Arc::clone(&shared), cancel_rx));

        for mut state_rx in state_receivers {
            let _ = state_rx
                .wait_for(|state| {
                    matches!(
                        state,
                        ConnectionState::Running
                            | ConnectionState::Terminated
                            | ConnectionState::Failed
                    )
                })
                .await;
        }
        shared.state_tx.send_if_modified(|state| {
            if matches!(state, SubscriberState::Starting) {
                *state = SubscriberState::Running;
                true
            } else {
                false
            }
        });

        Ok(Self {
            shared,
            state_rx,
            monitor: Mutex::new(Some(monitor)),
            tuner: Mutex::new(Some(tuner)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    /// The status that failed the subscriber, once in `Failed`.
    pub fn failure_cause(&self) -> Option<Status> {
        self.shared.failure.lock().expect("failure lock").clone()
    }

    /// Wait until the subscriber settles in `Terminated` or `Failed`.
    pub async fn await_terminated(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| {
                matches!(state, SubscriberState::Terminated | SubscriberState::Failed)
            })
            .await;
    }

    /// Stop intake, best-effort flush pending acks, and release shared
    /// resources. Idempotent: later calls wait for the first to finish.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            self.await_terminated().await;
            return;
        }
        tracing::info!(subscription = %self.shared.config.subscription, "stopping subscriber");
        self.shared.state_tx.send_if_modified(|state| {
            if matches!(state, SubscriberState::Failed) {
                false
            } else {
                *state = SubscriberState::Stopping;
                true
            }
        });
        let _ = self.shared.cancel_tx.send(true);
        let handles: Vec<ConnectionHandle> = self
            .shared
            .connections
            .lock()
            .expect("connections lock")
            .drain(..)
            .collect();
        for handle in &handles {
            let _ = handle.cancel_tx.send(true);
        }
        // Unblock intake stuck in flow reservations before joining the tasks.
        self.shared.flow.close();
        for handle in handles {
            let _ = handle.task.await;
        }
        let monitor = self.monitor.lock().expect("monitor lock").take();
        if let Some(task) = monitor {
            let _ = task.await;
        }
        let tuner = self.tuner.lock().expect("tuner lock").take();
        if let Some(task) = tuner {
            let _ = task.await;
        }
        // The monitor may have swapped in a polling fallback connection while
        // we were draining; sweep again now that it has quiesced.
        let stragglers: Vec<ConnectionHandle> = self
            .shared
            .connections
            .lock()
            .expect("connections lock")
            .drain(..)
            .collect();
        for handle in &stragglers {
            let _ = handle.cancel_tx.send(true);
        }
        for handle in stragglers {
            let _ = handle.task.await;
        }
        self.shared.state_tx.send_if_modified(|state| {
            if matches!(state, SubscriberState::Failed) {
                false
            } else {
                *state = SubscriberState::Terminated;
                true
            }
        });
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

async fn run_monitor(
    shared: Arc<Shared>,
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut fallback_done = false;
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            event = events_rx.recv() => match event {
                Some(ConnectionEvent::Fatal(status)) => {
                    tracing::error!(%status, "connection failed fatally; stopping subscriber");
                    fail_subscriber(&shared, status).await;
                    break;
                }
                Some(ConnectionEvent::StreamingUnimplemented) => {
                    if fallback_done {
                        continue;
                    }
                    fallback_done = true;
                    fall_back_to_polling(&shared).await;
                }
                None => break,
            }
        }
    }
}

async fn fail_subscriber(shared: &Shared, status: Status) {
    *shared.failure.lock().expect("failure lock") = Some(status);
    let _ = shared.state_tx.send(SubscriberState::Failed);
    let _ = shared.cancel_tx.send(true);
    let handles: Vec<ConnectionHandle> = shared
        .connections
        .lock()
        .expect("connections lock")
        .drain(..)
        .collect();
    for handle in &handles {
        let _ = handle.cancel_tx.send(true);
    }
    // Unblock intake stuck in flow reservations before joining the tasks.
    shared.flow.close();
    for handle in handles {
        let _ = handle.task.await;
    }
}

// Tear down the streaming fan-out and continue on one polling connection.
async fn fall_back_to_polling(shared: &Arc<Shared>) {
    tracing::info!("streaming pull unimplemented by server; falling back to unary polling");
    let handles: Vec<ConnectionHandle> = shared
        .connections
        .lock()
        .expect("connections lock")
        .drain(..)
        .collect();
    for handle in &handles {
        let _ = handle.cancel_tx.send(true);
    }
    for handle in handles {
        let _ = handle.task.await;
    }
    match shared.factory.open_channel().await {
        Ok(channel) => {
            let handle = spawn_connection(
                PullMode::Polling,
                Arc::clone(&shared.config),
                shared.current_deadline.load(Ordering::Relaxed),
                channel,
                Arc::clone(&shared.handler),
                Arc::clone(&shared.flow),
                Arc::clone(&shared.distribution),
                shared.events_tx.clone(),
            );
            shared
                .connections
                .lock()
                .expect("connections lock")
                .push(handle);
        }
        Err(status) => {
            tracing::error!(%status, "polling fallback channel failed");
            fail_subscriber(shared, status).await;
        }
    }
}

// Periodically size the stream ack deadline just above the observed
// worst-case handler latency, so extensions stay rare without inflating
// redelivery time after a crash.
async fn run_deadline_tuner(shared: Arc<Shared>, mut cancel: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(ACK_DEADLINE_UPDATE_PERIOD) => {
                let observed = shared.distribution.percentile(ACK_DEADLINE_PERCENTILE) as u32;
                let target = observed.clamp(
                    MIN_STREAM_ACK_DEADLINE_SECONDS,
                    MAX_STREAM_ACK_DEADLINE_SECONDS,
                );
                let current = shared.current_deadline.load(Ordering::Relaxed);
                if target != current {
                    shared.current_deadline.store(target, Ordering::Relaxed);
                    tracing::debug!(
                        previous = current,
                        updated = target,
                        "re-tuning stream ack deadline"
                    );
                    let connections = shared.connections.lock().expect("connections lock");
                    for handle in connections.iter() {
                        let _ = handle
                            .command_tx
                            .send(ConnectionCommand::UpdateStreamAckDeadline(target));
                    }
                }
            }
        }
    }
}
