//! Delivery worker
//!
//! The single consumer of the outbound queue. Each [`DeliveryWorker::step`]
//! walks one pass of the state machine:
//!
//! ```text
//! AwaitingItem -> CheckConnection -> Encode -> Publish -> Commit | Requeue
//!                       |
//!                       +-> Recovering
//! ```
//!
//! The head is peeked, never popped, until the broker confirms the publish,
//! so a message survives any number of failed attempts and queue order is
//! the delivery order.

use crate::codec::{self, EncodeBuffer, Encoding};
use crate::config::BridgeConfig;
use crate::observability::metrics::metrics;
use crate::queue::{Message, OutboundQueue, DEFAULT_PEEK_TIMEOUT};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{BrokerTransport, NetworkLink, Qos};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Tells the producing subsystem it may continue after a delivery
pub trait ResumeSignal: Send + Sync {
    fn resume(&self);
}

impl<F> ResumeSignal for F
where
    F: Fn() + Send + Sync,
{
    fn resume(&self) {
        self()
    }
}

/// Where the worker is in its delivery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingItem,
    CheckConnection,
    Recovering,
    Encode,
    Publish,
    Commit,
    Requeue,
}

/// Result of one pass through the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing queued within the peek timeout
    Idle,
    /// Head delivered and removed
    Delivered,
    /// Publish failed, head kept for the next pass
    PublishFailed,
    /// Network link could not be brought up
    LinkDown,
    /// A reconnect was attempted
    Recovered { connected: bool },
    /// Head could not be encoded and was dropped
    Discarded,
    Shutdown,
}

/// Delivery parameters fixed at startup
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub encoding: Encoding,
    pub out_prefix: String,
    pub data_qos: Qos,
    pub peek_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            out_prefix: "paxout".to_string(),
            data_qos: Qos::AtLeastOnce,
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            encoding: config.bridge.encoding,
            out_prefix: config.topics.out_prefix.clone(),
            data_qos: config.mqtt.data_qos(),
            peek_timeout: config.peek_timeout(),
            retry_interval: config.retry_interval(),
        }
    }

    /// `<out_prefix>/<port>`
    pub fn topic_for(&self, port: u8) -> String {
        format!("{}/{}", self.out_prefix, port)
    }
}

pub struct DeliveryWorker<T, L> {
    queue: Arc<OutboundQueue>,
    supervisor: ConnectionSupervisor<T>,
    link: L,
    resume: Arc<dyn ResumeSignal>,
    settings: WorkerSettings,
    buffer: EncodeBuffer,
    state: WorkerState,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T, L> DeliveryWorker<T, L>
where
    T: BrokerTransport,
    L: NetworkLink,
{
    pub fn new(
        queue: Arc<OutboundQueue>,
        supervisor: ConnectionSupervisor<T>,
        link: L,
        resume: Arc<dyn ResumeSignal>,
        settings: WorkerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            supervisor,
            link,
            resume,
            settings,
            buffer: EncodeBuffer::new(),
            state: WorkerState::AwaitingItem,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<T> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ConnectionSupervisor<T> {
        &mut self.supervisor
    }

    fn enter(&mut self, next: WorkerState) {
        trace!("Delivery worker: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until shutdown, then tear the broker session down.
    pub async fn run(mut self) {
        info!(
            encoding = %self.settings.encoding,
            out_prefix = %self.settings.out_prefix,
            "Delivery worker started"
        );
        metrics().set_bridge_state("running");

        if !self.shutdown_requested() {
            let connected = self.link.ensure_up().await && self.supervisor.reconnect().await;
            if !connected {
                info!("Initial broker connection failed, will retry when data is pending");
            }
        }

        while self.step().await != StepOutcome::Shutdown {}

        metrics().set_bridge_state("stopping");
        self.supervisor.teardown().await;
        metrics().set_bridge_state("stopped");
        info!("Delivery worker stopped");
    }

    /// One pass through the delivery cycle
    pub async fn step(&mut self) -> StepOutcome {
        self.enter(WorkerState::AwaitingItem);

        let queue = Arc::clone(&self.queue);
        let peek = queue.peek_head(self.settings.peek_timeout);
        let Some(head) = until_shutdown(&mut self.shutdown_rx, peek).await else {
            return StepOutcome::Shutdown;
        };

        let Some(message) = head else {
            // Idle tick: keep the session alive and pick up inbound commands
            if self.supervisor.is_connected() {
                self.supervisor.process_pending_io().await;
            }
            return StepOutcome::Idle;
        };

        if self.shutdown_requested() {
            return StepOutcome::Shutdown;
        }

        self.enter(WorkerState::CheckConnection);
        if !self.supervisor.is_connected() {
            return self.recover().await;
        }
        self.supervisor.process_pending_io().await;

        let span = crate::delivery_span!(port = message.port(), len = message.len());
        self.deliver(&message).instrument(span).await
    }

    async fn recover(&mut self) -> StepOutcome {
        self.enter(WorkerState::Recovering);
        let retry_interval = self.settings.retry_interval;

        if !self.link.ensure_up().await {
            warn!("Network link down, retrying in {:?}", retry_interval);
            metrics().network_link_failed();
            let sleep = tokio::time::sleep(retry_interval);
            if until_shutdown(&mut self.shutdown_rx, sleep).await.is_none() {
                return StepOutcome::Shutdown;
            }
            return StepOutcome::LinkDown;
        }

        debug!("Broker connection lost, reconnecting in {:?}", retry_interval);
        let sleep = tokio::time::sleep(retry_interval);
        if until_shutdown(&mut self.shutdown_rx, sleep).await.is_none() {
            return StepOutcome::Shutdown;
        }

        let connected = self.supervisor.reconnect().await;
        StepOutcome::Recovered { connected }
    }

    async fn deliver(&mut self, message: &Message) -> StepOutcome {
        self.enter(WorkerState::Encode);
        let topic = self.settings.topic_for(message.port());

        if let Err(e) = codec::encode(self.settings.encoding, message.payload(), &mut self.buffer) {
            error!("Dropping message that cannot be encoded: {}", e);
            metrics().record_encode_failed();
            self.queue.commit_head(message);
            return StepOutcome::Discarded;
        }

        self.enter(WorkerState::Publish);
        let result = self
            .supervisor
            .publish(&topic, self.buffer.as_bytes(), false, self.settings.data_qos)
            .await;

        match result {
            Ok(()) => {
                self.enter(WorkerState::Commit);
                self.queue.commit_head(message);
                metrics().record_published();
                debug!(topic = %topic, "Message delivered");
                self.resume.resume();
                StepOutcome::Delivered
            }
            Err(e) => {
                self.enter(WorkerState::Requeue);
                metrics().record_publish_failed();
                debug!(topic = %topic, "Publish failed, keeping message queued: {}", e);
                StepOutcome::PublishFailed
            }
        }
    }
}

/// Drive `fut` unless shutdown is signalled first. A dropped sender counts as
/// shutdown.
async fn until_shutdown<F: Future>(
    shutdown_rx: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *shutdown_rx.borrow_and_update() {
        return None;
    }

    tokio::select! {
        output = fut => Some(output),
        _ = wait_for_shutdown(shutdown_rx) => None,
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if shutdown_rx.changed().await.is_err() || *shutdown_rx.borrow_and_update() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{ConnectionState, SessionSettings};
    use crate::testing::mocks::{MockLink, MockTransport, RecordingResume};

    fn session() -> SessionSettings {
        SessionSettings {
            host: "broker.local".to_string(),
            port: 1883,
            client_id: "paxcounter-01".to_string(),
            credentials: None,
            out_prefix: "paxout".to_string(),
            in_topic: "paxin".to_string(),
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            peek_timeout: Duration::from_millis(20),
            retry_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    struct Harness {
        worker: DeliveryWorker<MockTransport, MockLink>,
        queue: Arc<OutboundQueue>,
        resume: RecordingResume,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness(transport: MockTransport, link: MockLink) -> Harness {
        let queue = Arc::new(OutboundQueue::new(4).unwrap());
        let resume = RecordingResume::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = ConnectionSupervisor::new(transport, session(), None);
        let worker = DeliveryWorker::new(
            queue.clone(),
            supervisor,
            link,
            Arc::new(resume.clone()),
            settings(),
            shutdown_rx,
        );
        Harness {
            worker,
            queue,
            resume,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[test]
    fn test_topic_for_port() {
        assert_eq!(settings().topic_for(1), "paxout/1");
        assert_eq!(settings().topic_for(255), "paxout/255");
    }

    #[test]
    fn test_closure_resume_signal() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let signal: Arc<dyn ResumeSignal> = Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        signal.resume();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let mut h = harness(MockTransport::new(), MockLink::up());
        assert_eq!(h.worker.step().await, StepOutcome::Idle);
        assert_eq!(h.worker.state(), WorkerState::AwaitingItem);
    }

    #[tokio::test]
    async fn test_delivers_base64_on_port_topic() {
        let transport = MockTransport::new();
        let log = transport.log();
        let mut h = harness(transport, MockLink::up());
        assert!(h.worker.supervisor_mut().reconnect().await);
        log.clear();

        h.queue.enqueue(Message::new(&[0x01, 0x02], 1).unwrap());
        assert_eq!(h.worker.step().await, StepOutcome::Delivered);
        assert_eq!(h.worker.state(), WorkerState::Commit);

        let published = log.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "paxout/1");
        assert_eq!(published[0].payload, b"AQI=".to_vec());
        assert!(!published[0].retained);
        assert_eq!(published[0].qos, Qos::AtLeastOnce);
        assert_eq!(h.queue.depth(), 0);
        assert_eq!(h.resume.count(), 1);
    }

    #[tokio::test]
    async fn test_summary_encoding() {
        let transport = MockTransport::new();
        let log = transport.log();
        let mut h = harness(transport, MockLink::up());
        h.worker.settings.encoding = Encoding::Summary;
        assert!(h.worker.supervisor_mut().reconnect().await);
        log.clear();

        h.queue.enqueue(Message::new(&[5, 0, 3, 0], 2).unwrap());
        assert_eq!(h.worker.step().await, StepOutcome::Delivered);
        assert_eq!(
            log.published()[0].payload,
            b"{'total':8,'ble':3,'wifi':5}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_head() {
        let transport = MockTransport::new();
        let control = transport.control();
        let mut h = harness(transport, MockLink::up());
        assert!(h.worker.supervisor_mut().reconnect().await);

        control.fail_next_publishes(1);
        h.queue.enqueue(Message::new(&[9], 3).unwrap());

        assert_eq!(h.worker.step().await, StepOutcome::PublishFailed);
        assert_eq!(h.worker.state(), WorkerState::Requeue);
        assert_eq!(h.queue.depth(), 1);
        assert_eq!(h.resume.count(), 0);

        assert_eq!(h.worker.step().await, StepOutcome::Delivered);
        assert_eq!(h.queue.depth(), 0);
        assert_eq!(h.resume.count(), 1);
    }

    #[tokio::test]
    async fn test_no_delivery_after_failed_session_setup() {
        let transport = MockTransport::new();
        let log = transport.log();
        let control = transport.control();
        let mut h = harness(transport, MockLink::up());

        control.fail_subscribe(true);
        assert!(!h.worker.supervisor_mut().reconnect().await);
        h.queue.enqueue(Message::new(&[1], 1).unwrap());

        assert_eq!(
            h.worker.step().await,
            StepOutcome::Recovered { connected: false }
        );
        assert!(log.published_on("paxout/1").is_empty());
        assert_eq!(h.queue.depth(), 1);

        control.fail_subscribe(false);
        assert_eq!(
            h.worker.step().await,
            StepOutcome::Recovered { connected: true }
        );
        assert_eq!(h.worker.step().await, StepOutcome::Delivered);
        assert_eq!(log.published_on("paxout/1").len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_recovers_before_publishing() {
        let transport = MockTransport::new();
        let log = transport.log();
        let mut h = harness(transport, MockLink::up());

        h.queue.enqueue(Message::new(&[1], 1).unwrap());
        assert_eq!(
            h.worker.step().await,
            StepOutcome::Recovered { connected: true }
        );
        assert_eq!(h.worker.supervisor().state(), ConnectionState::Connected);
        assert!(log.published_on("paxout/1").is_empty());
        assert_eq!(h.queue.depth(), 1);

        assert_eq!(h.worker.step().await, StepOutcome::Delivered);
        assert_eq!(log.published_on("paxout/1").len(), 1);
    }

    #[tokio::test]
    async fn test_link_down_does_not_touch_queue() {
        let transport = MockTransport::new();
        let log = transport.log();
        let link = MockLink::down();
        let mut h = harness(transport, link.clone());

        h.queue.enqueue(Message::new(&[1], 1).unwrap());
        assert_eq!(h.worker.step().await, StepOutcome::LinkDown);
        assert!(log.calls().is_empty());
        assert_eq!(h.queue.depth(), 1);
        assert_eq!(link.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_item() {
        let transport = MockTransport::new();
        transport.control().fail_connect(true);
        let mut h = harness(transport, MockLink::up());

        h.queue.enqueue(Message::new(&[1], 1).unwrap());
        assert_eq!(
            h.worker.step().await,
            StepOutcome::Recovered { connected: false }
        );
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_wait() {
        let queue = Arc::new(OutboundQueue::new(1).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = ConnectionSupervisor::new(MockTransport::new(), session(), None);
        let mut worker = DeliveryWorker::new(
            queue,
            supervisor,
            MockLink::up(),
            Arc::new(RecordingResume::new()),
            WorkerSettings {
                peek_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            shutdown_rx,
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = shutdown_tx.send(true);
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), worker.step())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_run_tears_down_on_shutdown() {
        let transport = MockTransport::new();
        let log = transport.log();
        let queue = Arc::new(OutboundQueue::new(1).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = ConnectionSupervisor::new(transport, session(), None);
        let worker = DeliveryWorker::new(
            queue,
            supervisor,
            MockLink::up(),
            Arc::new(RecordingResume::new()),
            settings(),
            shutdown_rx,
        );

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(log.calls().contains(&crate::testing::mocks::TransportCall::Disconnect));
    }
}
