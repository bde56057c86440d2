//! Inbound command dispatch
//!
//! The transport calls [`InboundDispatcher::handle`] for every message it
//! receives, from inside the worker's I/O processing. The handler only
//! filters, decodes and hands off through a bounded channel; the command
//! interpreter runs on its own task via [`spawn_command_loop`].

use crate::codec;
use crate::observability::metrics::metrics;
use crate::transport::InboundHandler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default depth of the command channel
pub const DEFAULT_COMMAND_CAPACITY: usize = 16;

/// A decoded command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub bytes: Vec<u8>,
}

/// Interprets decoded commands
pub trait CommandHandler: Send + Sync {
    fn handle_command(&self, bytes: &[u8]);
}

impl<F> CommandHandler for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn handle_command(&self, bytes: &[u8]) {
        self(bytes)
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not on the control topic
    Ignored,
    Forwarded,
    /// Command channel full or closed
    Dropped,
}

pub struct InboundDispatcher {
    control_topic: String,
    tx: mpsc::Sender<Command>,
}

impl InboundDispatcher {
    pub fn new(control_topic: impl Into<String>, tx: mpsc::Sender<Command>) -> Self {
        Self {
            control_topic: control_topic.into(),
            tx,
        }
    }

    /// Dispatcher plus the receiving end of a fresh command channel
    pub fn channel(
        control_topic: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(control_topic, tx), rx)
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    /// Filter, decode and forward one inbound message. Never blocks.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        if topic != self.control_topic {
            debug!(topic = %topic, "Ignoring message on unexpected topic");
            return DispatchOutcome::Ignored;
        }

        let bytes = codec::decode(payload);
        debug!(
            topic = %topic,
            encoded_len = payload.len(),
            decoded_len = bytes.len(),
            "Control message received"
        );

        match self.tx.try_send(Command { bytes }) {
            Ok(()) => {
                metrics().record_command_received();
                DispatchOutcome::Forwarded
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Command channel full, dropping command");
                metrics().record_command_dropped();
                DispatchOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Command interpreter gone, dropping command");
                metrics().record_command_dropped();
                DispatchOutcome::Dropped
            }
        }
    }

    /// Wrap as the transport's inbound handler
    pub fn into_handler(self) -> InboundHandler {
        let dispatcher = Arc::new(self);
        Arc::new(move |topic: &str, payload: &[u8]| {
            dispatcher.handle(topic, payload);
        })
    }
}

/// Feed every received command to `handler` until the channel closes
pub fn spawn_command_loop(
    mut rx: mpsc::Receiver<Command>,
    handler: Arc<dyn CommandHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            handler.handle_command(&command.bytes);
        }
        info!("Command channel closed, command loop finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_ignores_other_topics() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 4);
        assert_eq!(
            dispatcher.handle("paxout/1", b"AQI="),
            DispatchOutcome::Ignored
        );
        assert_eq!(dispatcher.handle("paxin/extra", b"AQI="), DispatchOutcome::Ignored);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_decodes_control_message() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 4);
        assert_eq!(dispatcher.handle("paxin", b"AQI="), DispatchOutcome::Forwarded);
        assert_eq!(rx.try_recv().unwrap(), Command { bytes: vec![1, 2] });
    }

    #[test]
    fn test_retained_clear_forwards_empty_command() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 4);
        dispatcher.handle("paxin", b"");
        assert_eq!(rx.try_recv().unwrap().bytes, Vec::<u8>::new());
    }

    #[test]
    fn test_malformed_payload_forwards_empty_command() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 4);
        dispatcher.handle("paxin", b"not base64!");
        assert!(rx.try_recv().unwrap().bytes.is_empty());
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 1);
        assert_eq!(dispatcher.handle("paxin", b"AQ=="), DispatchOutcome::Forwarded);
        assert_eq!(dispatcher.handle("paxin", b"Ag=="), DispatchOutcome::Dropped);
        assert_eq!(rx.try_recv().unwrap().bytes, vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_drops() {
        let (dispatcher, rx) = InboundDispatcher::channel("paxin", 1);
        drop(rx);
        assert_eq!(dispatcher.handle("paxin", b"AQ=="), DispatchOutcome::Dropped);
    }

    #[test]
    fn test_into_handler_dispatches() {
        let (dispatcher, mut rx) = InboundDispatcher::channel("paxin", 4);
        let handler = dispatcher.into_handler();
        handler("paxin", b"AQID");
        assert_eq!(rx.try_recv().unwrap().bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_command_loop_runs_until_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = spawn_command_loop(
            rx,
            Arc::new(move |bytes: &[u8]| sink.lock().unwrap().push(bytes.to_vec())),
        );

        tx.send(Command { bytes: vec![7] }).await.unwrap();
        tx.send(Command { bytes: vec![8, 9] }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![vec![7], vec![8, 9]]);
    }
}
