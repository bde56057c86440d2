//! Thread-safe metrics collection system
//!
//! Atomic counters for the outbound queue, the broker connection and inbound
//! commands. Producers, the delivery worker and the inbound dispatcher all
//! record into the same global collector.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Queue metrics
    messages_enqueued: AtomicU64,
    enqueue_rejected: AtomicU64,
    messages_flushed: AtomicU64,
    queue_depth: AtomicU64,
    max_queue_depth: AtomicU64,

    // Delivery metrics
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    encode_failures: AtomicU64,
    last_delivery: AtomicU64,

    // Connection metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    sessions_closed: AtomicU64,
    link_failures: AtomicU64,

    // Inbound metrics
    commands_received: AtomicU64,
    commands_dropped: AtomicU64,

    // Lifecycle
    bridge_state: Mutex<String>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_enqueued: AtomicU64::new(0),
            enqueue_rejected: AtomicU64::new(0),
            messages_flushed: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            max_queue_depth: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            last_delivery: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            link_failures: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            bridge_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp_ms()),
        }
    }

    // Queue metrics
    pub fn record_enqueued(&self, depth: usize) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
        self.set_queue_depth(depth);
    }

    pub fn record_enqueue_rejected(&self) {
        self.enqueue_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, dropped: usize) {
        self.messages_flushed
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.queue_depth.store(0, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        let depth = depth as u64;
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    // Delivery metrics
    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.last_delivery
            .store(current_timestamp_ms(), Ordering::Relaxed);
    }

    pub fn record_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failed(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Connection metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    /// Orderly disconnect at shutdown
    pub fn mqtt_connection_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn network_link_failed(&self) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Inbound metrics
    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle
    pub fn set_bridge_state(&self, state: &str) {
        if let Ok(mut current) = self.bridge_state.lock() {
            if *current != state {
                *current = state.to_string();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough snapshot for export
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp_ms();
        let last_delivery = self.last_delivery.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_ms: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            state: self
                .bridge_state
                .lock()
                .map(|s| s.clone())
                .unwrap_or_else(|_| "unknown".to_string()),
            queue: QueueMetrics {
                enqueued: self.messages_enqueued.load(Ordering::Relaxed),
                rejected: self.enqueue_rejected.load(Ordering::Relaxed),
                flushed: self.messages_flushed.load(Ordering::Relaxed),
                depth: self.queue_depth.load(Ordering::Relaxed),
                max_depth: self.max_queue_depth.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                encode_failures: self.encode_failures.load(Ordering::Relaxed),
                last_delivery: timestamp_to_datetime(last_delivery),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
                link_failures: self.link_failures.load(Ordering::Relaxed),
            },
            inbound: InboundMetrics {
                commands_received: self.commands_received.load(Ordering::Relaxed),
                commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of all bridge metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_ms: u64,
    pub state: String,
    pub queue: QueueMetrics,
    pub delivery: DeliveryMetrics,
    pub mqtt: MqttMetrics,
    pub inbound: InboundMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub rejected: u64,
    pub flushed: u64,
    pub depth: u64,
    pub max_depth: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub encode_failures: u64,
    pub last_delivery: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub sessions_closed: u64,
    pub link_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub commands_received: u64,
    pub commands_dropped: u64,
}

pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn timestamp_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}
