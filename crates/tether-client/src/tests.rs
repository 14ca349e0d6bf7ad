// End-to-end scenarios against an in-memory fake transport, driven on the
// paused tokio clock so alarms and backoffs are deterministic.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_transport::{ChannelFactory, StreamSink, StreamSource, SubscriberChannel};
use tether_wire::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PullRequest, PullResponse, ReceivedMessage,
    Status, StatusCode, StreamRequest, StreamResponse,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, advance, timeout};

use crate::config::{PullMode, SubscriberConfig};
use crate::handler::{MessageHandler, Reply};
use crate::pump::PENDING_ACKS_SEND_DELAY;
use crate::subscriber::{Subscriber, SubscriberState};

const TEST_SUBSCRIPTION: &str = "projects/test-project/subscriptions/test-subscription";
const WAIT_LIMIT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Fake subscriber service, the in-memory stand-in for the server side.

type StreamResult = Result<StreamResponse, Status>;

#[derive(Default)]
struct FakeState {
    streaming_enabled: bool,
    channels_opened: usize,
    opened_streams: usize,
    closed_streams: usize,
    live_streams: Vec<mpsc::UnboundedSender<StreamResult>>,
    acks: Vec<String>,
    modify_deadlines: Vec<(String, u32)>,
    stream_deadlines: Vec<u32>,
    pull_responses: VecDeque<Vec<ReceivedMessage>>,
    pull_errors: VecDeque<Status>,
}

struct FakeService {
    state: Mutex<FakeState>,
    // Bumped on every recorded change so waiters never miss an update.
    version: watch::Sender<u64>,
}

impl FakeService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                streaming_enabled: true,
                ..FakeState::default()
            }),
            version: watch::channel(0).0,
        })
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    fn without_streaming() -> Arc<Self> {
        let service = Self::new();
        service.state.lock().unwrap().streaming_enabled = false;
        service
    }

    fn factory(self: &Arc<Self>) -> Arc<dyn ChannelFactory> {
        Arc::new(FakeFactory {
            service: Arc::clone(self),
        })
    }

    fn messages(ack_ids: &[&str]) -> Vec<ReceivedMessage> {
        ack_ids
            .iter()
            .map(|ack_id| ReceivedMessage {
                ack_id: ack_id.to_string(),
                payload: Bytes::from_static(b"payload"),
            })
            .collect()
    }

    // Deliver one response frame on the first live stream.
    fn send_streaming_response(&self, ack_ids: &[&str]) {
        let state = self.state.lock().unwrap();
        let sender = state.live_streams.first().expect("no live stream");
        sender
            .send(Ok(StreamResponse {
                messages: Self::messages(ack_ids),
            }))
            .expect("stream receiver gone");
    }

    // Fail the first live stream with the given status.
    fn send_stream_error(&self, status: Status) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.live_streams.is_empty(), "no live stream");
        let sender = state.live_streams.remove(0);
        let _ = sender.send(Err(status));
    }

    fn enqueue_pull_response(&self, ack_ids: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .pull_responses
            .push_back(Self::messages(ack_ids));
    }

    fn enqueue_pull_error(&self, status: Status) {
        self.state.lock().unwrap().pull_errors.push_back(status);
    }

    async fn wait_until<F>(&self, what: &str, condition: F)
    where
        F: Fn(&FakeState) -> bool,
    {
        let mut version_rx = self.version.subscribe();
        let result = timeout(WAIT_LIMIT, async {
            loop {
                version_rx.borrow_and_update();
                if condition(&self.state.lock().unwrap()) {
                    return;
                }
                if version_rx.changed().await.is_err() {
                    panic!("fake service gone while waiting for {what}");
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {what}");
    }

    async fn wait_and_consume_acks(&self, count: usize) -> Vec<String> {
        self.wait_until("acks", |state| state.acks.len() >= count)
            .await;
        self.state.lock().unwrap().acks.drain(..count).collect()
    }

    async fn wait_and_consume_modify_deadlines(&self, count: usize) -> Vec<(String, u32)> {
        self.wait_until("modify-ack-deadlines", |state| {
            state.modify_deadlines.len() >= count
        })
        .await;
        self.state
            .lock()
            .unwrap()
            .modify_deadlines
            .drain(..count)
            .collect()
    }

    async fn wait_for_stream_deadline(&self, seconds: u32) {
        self.wait_until("stream ack deadline", |state| {
            state.stream_deadlines.last() == Some(&seconds)
        })
        .await;
    }

    async fn wait_for_live_streams(&self, count: usize) {
        self.wait_until("live streams", |state| state.live_streams.len() == count)
            .await;
    }

    fn ack_count(&self) -> usize {
        self.state.lock().unwrap().acks.len()
    }

    fn modify_count(&self) -> usize {
        self.state.lock().unwrap().modify_deadlines.len()
    }

    fn channels_opened(&self) -> usize {
        self.state.lock().unwrap().channels_opened
    }

    fn opened_streams(&self) -> usize {
        self.state.lock().unwrap().opened_streams
    }

    fn closed_streams(&self) -> usize {
        self.state.lock().unwrap().closed_streams
    }
}

struct FakeFactory {
    service: Arc<FakeService>,
}

#[async_trait]
impl ChannelFactory for FakeFactory {
    async fn open_channel(&self) -> Result<Arc<dyn SubscriberChannel>, Status> {
        let mut state = self.service.state.lock().unwrap();
        state.channels_opened += 1;
        drop(state);
        self.service.bump();
        Ok(Arc::new(FakeChannel {
            service: Arc::clone(&self.service),
        }))
    }
}

struct FakeChannel {
    service: Arc<FakeService>,
}

#[async_trait]
impl SubscriberChannel for FakeChannel {
    async fn open_stream(
        &self,
        initial: StreamRequest,
    ) -> Result<(Box<dyn StreamSink>, Box<dyn StreamSource>), Status> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.service.state.lock().unwrap();
            if !state.streaming_enabled {
                return Err(Status::unimplemented("streaming pull not supported"));
            }
            assert_eq!(initial.subscription, TEST_SUBSCRIPTION);
            state.opened_streams += 1;
            state
                .stream_deadlines
                .push(initial.stream_ack_deadline_seconds);
            state.live_streams.push(response_tx);
        }
        self.service.bump();
        Ok((
            Box::new(FakeSink {
                service: Arc::clone(&self.service),
            }),
            Box::new(FakeSource {
                service: Arc::clone(&self.service),
                response_rx,
            }),
        ))
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, Status> {
        assert_eq!(request.subscription, TEST_SUBSCRIPTION);
        let mut state = self.service.state.lock().unwrap();
        if let Some(status) = state.pull_errors.pop_front() {
            return Err(status);
        }
        let messages = state.pull_responses.pop_front().unwrap_or_default();
        Ok(PullResponse { messages })
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status> {
        let mut state = self.service.state.lock().unwrap();
        state.acks.extend(request.ack_ids);
        drop(state);
        self.service.bump();
        Ok(())
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status> {
        let mut state = self.service.state.lock().unwrap();
        for ack_id in request.ack_ids {
            state
                .modify_deadlines
                .push((ack_id, request.ack_deadline_seconds));
        }
        drop(state);
        self.service.bump();
        Ok(())
    }
}

struct FakeSink {
    service: Arc<FakeService>,
}

#[async_trait]
impl StreamSink for FakeSink {
    async fn send(&mut self, request: StreamRequest) -> Result<(), Status> {
        let mut state = self.service.state.lock().unwrap();
        // A deadline-only frame re-tunes the stream.
        if request.subscription.is_empty() && request.stream_ack_deadline_seconds > 0 {
            state
                .stream_deadlines
                .push(request.stream_ack_deadline_seconds);
        }
        for change in request.modify_deadlines {
            state
                .modify_deadlines
                .push((change.ack_id, change.extension_seconds));
        }
        state.acks.extend(request.ack_ids);
        drop(state);
        self.service.bump();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Status> {
        Ok(())
    }
}

struct FakeSource {
    service: Arc<FakeService>,
    response_rx: mpsc::UnboundedReceiver<StreamResult>,
}

#[async_trait]
impl StreamSource for FakeSource {
    async fn recv(&mut self) -> Result<Option<StreamResponse>, Status> {
        match self.response_rx.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        let mut state = self.service.state.lock().unwrap();
        state.closed_streams += 1;
        drop(state);
        self.service.bump();
    }
}

// ---------------------------------------------------------------------------
// Test handler, with the reply modes of the scenarios.

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReplyMode {
    Ack,
    Nack,
    Error,
    DropReply,
    Hold,
}

struct TestHandler {
    mode: Mutex<ReplyMode>,
    received: AtomicUsize,
    held: Mutex<VecDeque<Reply>>,
    version: watch::Sender<u64>,
}

impl TestHandler {
    fn new(mode: ReplyMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            received: AtomicUsize::new(0),
            held: Mutex::new(VecDeque::new()),
            version: watch::channel(0).0,
        })
    }

    fn set_mode(&self, mode: ReplyMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    async fn wait_received(&self, count: usize) {
        let mut version_rx = self.version.subscribe();
        let result = timeout(WAIT_LIMIT, async {
            loop {
                version_rx.borrow_and_update();
                if self.received() >= count {
                    return;
                }
                if version_rx.changed().await.is_err() {
                    panic!("handler gone while waiting for deliveries");
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {count} deliveries");
    }

    fn reply_next(&self) {
        let reply = self
            .held
            .lock()
            .unwrap()
            .pop_front()
            .expect("no outstanding reply");
        match *self.mode.lock().unwrap() {
            ReplyMode::Nack => reply.nack(),
            ReplyMode::Error => reply.error(anyhow::anyhow!("cannot process message")),
            _ => reply.ack(),
        }
    }

    fn reply_all(&self) {
        loop {
            let next = self.held.lock().unwrap().pop_front();
            match next {
                Some(reply) => reply.ack(),
                None => break,
            }
        }
    }
}

impl MessageHandler for TestHandler {
    fn receive(&self, _message: ReceivedMessage, reply: Reply) {
        self.received.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock().unwrap() {
            ReplyMode::Ack => reply.ack(),
            ReplyMode::Nack => reply.nack(),
            ReplyMode::Error => reply.error(anyhow::anyhow!("cannot process message")),
            ReplyMode::DropReply => drop(reply),
            ReplyMode::Hold => self.held.lock().unwrap().push_back(reply),
        }
        self.version.send_modify(|version| *version += 1);
    }
}

// ---------------------------------------------------------------------------
// Helpers.

fn test_config() -> SubscriberConfig {
    let mut config = SubscriberConfig::new(TEST_SUBSCRIPTION);
    config.channels_per_core = 1;
    config
}

fn cores() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

// Let already-woken tasks (handler completions, ack bookkeeping) run.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn start_subscriber(
    config: SubscriberConfig,
    service: &Arc<FakeService>,
    handler: Arc<TestHandler>,
) -> Subscriber {
    Subscriber::start(config, service.factory(), handler)
        .await
        .expect("start subscriber")
}

fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

// ---------------------------------------------------------------------------
// Streaming scenarios.

#[tokio::test(start_paused = true)]
async fn ack_single_message() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A"]);
    handler.wait_received(1).await;
    settle().await;

    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
    assert_eq!(
        service.wait_and_consume_acks(1).await,
        vec!["A".to_string()]
    );
    assert_eq!(service.modify_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn nack_single_message() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Nack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A"]);
    handler.wait_received(1).await;
    settle().await;

    subscriber.stop().await;
    assert_eq!(
        service.wait_and_consume_modify_deadlines(1).await,
        vec![("A".to_string(), 0)]
    );
    assert_eq!(service.ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn handler_error_nacks_message() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Error);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A"]);
    handler.wait_received(1).await;
    settle().await;

    subscriber.stop().await;
    assert_eq!(
        service.wait_and_consume_modify_deadlines(1).await,
        vec![("A".to_string(), 0)]
    );
    assert_eq!(service.ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_reply_nacks_message() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::DropReply);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A"]);
    handler.wait_received(1).await;
    settle().await;

    subscriber.stop().await;
    assert_eq!(
        service.wait_and_consume_modify_deadlines(1).await,
        vec![("A".to_string(), 0)]
    );
}

#[tokio::test(start_paused = true)]
async fn batched_acks_flush_on_the_send_delay() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A", "B", "C"]);
    handler.wait_received(3).await;
    settle().await;

    advance(PENDING_ACKS_SEND_DELAY).await;
    assert_eq!(
        sorted(service.wait_and_consume_acks(3).await),
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    );

    // The next batch re-arms the send alarm from scratch.
    service.send_streaming_response(&["D", "E"]);
    handler.wait_received(5).await;
    settle().await;

    advance(PENDING_ACKS_SEND_DELAY).await;
    assert_eq!(
        sorted(service.wait_and_consume_acks(2).await),
        vec!["D".to_string(), "E".to_string()]
    );

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn batched_acks_and_nacks_travel_together() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A", "B", "C"]);
    handler.wait_received(3).await;

    handler.set_mode(ReplyMode::Nack);
    service.send_streaming_response(&["D", "E"]);
    handler.wait_received(5).await;
    settle().await;

    advance(PENDING_ACKS_SEND_DELAY).await;
    assert_eq!(
        sorted(service.wait_and_consume_acks(3).await),
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    );
    let mut nacks = service.wait_and_consume_modify_deadlines(2).await;
    nacks.sort();
    assert_eq!(nacks, vec![("D".to_string(), 0), ("E".to_string(), 0)]);

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deadline_extensions_seed_at_two_seconds_and_double() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Hold);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A", "B", "C"]);
    handler.wait_received(3).await;
    settle().await;

    // First renewal fires at the 10s stream deadline minus 1s padding. The
    // distribution is empty, so the lease seeds at the 2s floor.
    advance(Duration::from_secs(9)).await;
    let mut renewals = service.wait_and_consume_modify_deadlines(3).await;
    renewals.sort();
    assert_eq!(
        renewals,
        vec![
            ("A".to_string(), 2),
            ("B".to_string(), 2),
            ("C".to_string(), 2)
        ]
    );

    // The renewed 2s leases double on the next tick.
    advance(Duration::from_secs(2)).await;
    let mut renewals = service.wait_and_consume_modify_deadlines(3).await;
    renewals.sort();
    assert_eq!(
        renewals,
        vec![
            ("A".to_string(), 4),
            ("B".to_string(), 4),
            ("C".to_string(), 4)
        ]
    );

    handler.reply_all();
    settle().await;
    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stream_ack_deadline_tracks_handler_latency() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Hold);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.wait_for_stream_deadline(10).await;

    // One slow message: 20 seconds from receive to ack.
    service.send_streaming_response(&["A"]);
    handler.wait_received(1).await;
    settle().await;
    advance(Duration::from_secs(20)).await;
    handler.reply_next();
    settle().await;

    // The next tuning tick sizes the stream deadline to the observed p99.
    advance(Duration::from_secs(60)).await;
    service.wait_for_stream_deadline(20).await;

    // Flood with faster messages so the p99 falls back to 10 seconds.
    let ack_ids: Vec<String> = (0..999).map(|index| index.to_string()).collect();
    let ack_id_refs: Vec<&str> = ack_ids.iter().map(String::as_str).collect();
    service.send_streaming_response(&ack_id_refs);
    handler.wait_received(1000).await;
    settle().await;
    advance(Duration::from_secs(10)).await;
    handler.reply_all();
    settle().await;

    advance(Duration::from_secs(60)).await;
    service.wait_for_stream_deadline(10).await;

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn streaming_opens_one_stream_per_channel() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let mut config = test_config();
    config.channels_per_core = 2;
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    let expected = cores() * 2;
    service.wait_for_live_streams(expected).await;
    assert_eq!(service.channels_opened(), expected);
    assert_eq!(service.opened_streams(), expected);

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retryable_error_reopens_the_stream() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    let expected = cores();
    service.wait_for_live_streams(expected).await;

    service.send_stream_error(Status::internal("server hiccup"));
    service
        .wait_until("one closed stream", |state| state.closed_streams == 1)
        .await;

    // The connection backs off briefly and reopens; the fan-out recovers.
    service.wait_for_live_streams(expected).await;
    assert_eq!(service.closed_streams(), 1);
    assert_eq!(service.opened_streams(), expected + 1);
    assert_eq!(subscriber.state(), SubscriberState::Running);

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fatal_error_fails_the_subscriber() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_stream_error(Status::invalid_argument("bad subscription"));

    timeout(WAIT_LIMIT, subscriber.await_terminated())
        .await
        .expect("subscriber settles");
    assert_eq!(subscriber.state(), SubscriberState::Failed);
    let cause = subscriber.failure_cause().expect("failure cause");
    assert_eq!(cause.code, StatusCode::InvalidArgument);

    // Stop after failure is a no-op that preserves the failed state.
    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Failed);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn flow_control_blocks_intake_at_the_message_limit() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Hold);
    let mut config = test_config();
    config.flow_control.max_outstanding_messages = Some(2);
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A", "B", "C", "D", "E"]);

    // Only two messages may be outstanding; intake stalls on the third.
    handler.wait_received(2).await;
    advance(Duration::from_secs(1)).await;
    assert_eq!(handler.received(), 2);

    // Resolving one admits exactly one more.
    handler.reply_next();
    handler.wait_received(3).await;
    advance(Duration::from_secs(1)).await;
    assert_eq!(handler.received(), 3);

    while handler.received() < 5 {
        handler.reply_all();
        tokio::task::yield_now().await;
    }
    handler.reply_all();
    settle().await;
    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_unblocks_a_saturated_flow_controller() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Hold);
    let mut config = test_config();
    config.flow_control.max_outstanding_messages = Some(1);
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    service.wait_for_live_streams(cores()).await;
    service.send_streaming_response(&["A", "B", "C"]);
    handler.wait_received(1).await;

    // Intake is wedged on the flow controller; stop must still finish.
    timeout(WAIT_LIMIT, subscriber.stop())
        .await
        .expect("stop completes");
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
}

// ---------------------------------------------------------------------------
// Polling scenarios.

#[tokio::test(start_paused = true)]
async fn polling_acks_and_nacks_via_unary_calls() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let mut config = test_config();
    config.pull_mode = PullMode::Polling;
    service.enqueue_pull_response(&["A"]);
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    handler.wait_received(1).await;
    assert_eq!(
        service.wait_and_consume_acks(1).await,
        vec!["A".to_string()]
    );

    handler.set_mode(ReplyMode::Nack);
    service.enqueue_pull_response(&["B"]);
    handler.wait_received(2).await;
    assert_eq!(
        service.wait_and_consume_modify_deadlines(1).await,
        vec![("B".to_string(), 0)]
    );

    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn polling_retries_transient_pull_errors() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let mut config = test_config();
    config.pull_mode = PullMode::Polling;
    service.enqueue_pull_error(Status::unavailable("backend busy"));
    service.enqueue_pull_response(&["A"]);
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    handler.wait_received(1).await;
    assert_eq!(
        service.wait_and_consume_acks(1).await,
        vec!["A".to_string()]
    );
    assert_eq!(subscriber.state(), SubscriberState::Running);

    subscriber.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polling_fatal_pull_error_fails_the_subscriber() {
    let service = FakeService::new();
    let handler = TestHandler::new(ReplyMode::Ack);
    let mut config = test_config();
    config.pull_mode = PullMode::Polling;
    service.enqueue_pull_error(Status::new(StatusCode::PermissionDenied, "no access"));
    let subscriber = start_subscriber(config, &service, Arc::clone(&handler)).await;

    timeout(WAIT_LIMIT, subscriber.await_terminated())
        .await
        .expect("subscriber settles");
    assert_eq!(subscriber.state(), SubscriberState::Failed);
    let cause = subscriber.failure_cause().expect("failure cause");
    assert_eq!(cause.code, StatusCode::PermissionDenied);
}

#[tokio::test(start_paused = true)]
async fn streaming_unimplemented_falls_back_to_polling() {
    let service = FakeService::without_streaming();
    let handler = TestHandler::new(ReplyMode::Ack);
    service.enqueue_pull_response(&["A"]);
    let subscriber = start_subscriber(test_config(), &service, Arc::clone(&handler)).await;

    // The polling fallback picks up where streaming could not start.
    handler.wait_received(1).await;
    assert_eq!(
        service.wait_and_consume_acks(1).await,
        vec!["A".to_string()]
    );

    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
}
