//! Bridge context
//!
//! [`TelemetryBridge`] wires the pieces together: it owns the outbound queue,
//! spawns the delivery worker and the command loop, and hands out the
//! producer interface. Dropping it signals the worker to stop; call
//! [`TelemetryBridge::shutdown`] to also wait for the broker session to be
//! torn down.

use crate::config::BridgeConfig;
use crate::dispatcher::{spawn_command_loop, CommandHandler, InboundDispatcher, DEFAULT_COMMAND_CAPACITY};
use crate::error::{BridgeError, BridgeResult};
use crate::queue::{Message, OutboundQueue, MAX_PAYLOAD_SIZE};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SessionSettings};
use crate::transport::{BrokerTransport, NetworkLink};
use crate::worker::{DeliveryWorker, ResumeSignal, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long shutdown waits for the command loop to drain
const COMMAND_LOOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap, cloneable handle for producer contexts
#[derive(Clone)]
pub struct BridgeProducer {
    queue: Arc<OutboundQueue>,
}

impl BridgeProducer {
    /// Queue `payload` for delivery on `<out_prefix>/<port>`.
    ///
    /// `Ok(false)` means the queue is full and nothing was queued.
    pub fn enqueue(&self, payload: &[u8], port: u8) -> BridgeResult<bool> {
        let message = Message::new(payload, port)
            .ok_or_else(|| BridgeError::payload_too_large(payload.len(), MAX_PAYLOAD_SIZE))?;
        Ok(self.queue.enqueue(message))
    }

    pub fn enqueue_message(&self, message: Message) -> bool {
        self.queue.enqueue(message)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}

/// Running telemetry bridge
pub struct TelemetryBridge {
    client_id: String,
    producer: BridgeProducer,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    command_loop: Option<JoinHandle<()>>,
}

impl TelemetryBridge {
    /// Allocate the queue and start the worker and command loop.
    ///
    /// Must be called from within a tokio runtime. Fails only on invalid
    /// configuration or when the queue cannot be allocated.
    pub fn start<T, L>(
        config: &BridgeConfig,
        transport: T,
        link: L,
        resume: Arc<dyn ResumeSignal>,
        commands: Arc<dyn CommandHandler>,
    ) -> BridgeResult<Self>
    where
        T: BrokerTransport + 'static,
        L: NetworkLink + 'static,
    {
        config.validate()?;

        let queue = Arc::new(OutboundQueue::new(config.bridge.queue_capacity)?);
        let session = SessionSettings::from_config(config)?;
        let settings = WorkerSettings::from_config(config);

        let (dispatcher, command_rx) =
            InboundDispatcher::channel(session.in_topic.clone(), DEFAULT_COMMAND_CAPACITY);
        let command_loop = spawn_command_loop(command_rx, commands);

        let supervisor = ConnectionSupervisor::new(transport, session, Some(dispatcher.into_handler()));
        let state_rx = supervisor.subscribe_state();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = DeliveryWorker::new(
            Arc::clone(&queue),
            supervisor,
            link,
            resume,
            settings,
            shutdown_rx,
        );
        let worker = tokio::spawn(worker.run());

        info!(
            client_id = %config.bridge.client_id,
            capacity = config.bridge.queue_capacity,
            "Telemetry bridge started"
        );

        Ok(Self {
            client_id: config.bridge.client_id.clone(),
            producer: BridgeProducer { queue },
            state_rx,
            shutdown_tx,
            worker: Some(worker),
            command_loop: Some(command_loop),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// See [`BridgeProducer::enqueue`]
    pub fn enqueue(&self, payload: &[u8], port: u8) -> BridgeResult<bool> {
        self.producer.enqueue(payload, port)
    }

    pub fn enqueue_message(&self, message: Message) -> bool {
        self.producer.enqueue_message(message)
    }

    pub fn queue_depth(&self) -> usize {
        self.producer.queue_depth()
    }

    /// Drop everything still queued. Returns the number of discarded messages.
    pub fn flush_queue(&self) -> usize {
        self.producer.queue.reset()
    }

    pub fn queue(&self) -> Arc<OutboundQueue> {
        Arc::clone(&self.producer.queue)
    }

    pub fn producer(&self) -> BridgeProducer {
        self.producer.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the worker, tear down the broker session and let the command
    /// loop drain. Messages still queued are discarded with the queue.
    pub async fn shutdown(mut self) {
        info!(client_id = %self.client_id, "Shutting down telemetry bridge");
        let _ = self.shutdown_tx.send(true);

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Delivery worker ended abnormally: {}", e);
            }
        }

        // The command channel closes once the worker has dropped the transport
        if let Some(mut command_loop) = self.command_loop.take() {
            match tokio::time::timeout(COMMAND_LOOP_DRAIN_TIMEOUT, &mut command_loop).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Command loop ended abnormally: {}", e),
                Err(_) => {
                    warn!("Command loop did not finish, aborting it");
                    command_loop.abort();
                }
            }
        }

        let pending = self.producer.queue_depth();
        if pending > 0 {
            warn!(pending, "Discarding undelivered messages at shutdown");
        }
        info!("Telemetry bridge shutdown complete");
    }
}

impl Drop for TelemetryBridge {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
