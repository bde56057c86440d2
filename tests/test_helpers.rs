//! Test helpers and utilities for integration tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::config::BridgeConfig;
use telemetry_bridge::testing::mocks::{MockLink, MockTransport, RecordingCommands, RecordingResume};
use telemetry_bridge::TelemetryBridge;

/// Configuration with short timings so the worker cycles quickly
#[allow(dead_code)]
pub fn test_config(capacity: usize) -> BridgeConfig {
    BridgeConfig::from_toml_str(&format!(
        r#"
[bridge]
client_id = "paxcounter-test"
queue_capacity = {capacity}
peek_timeout_ms = 20
retry_interval_secs = 0

[mqtt]
broker_url = "mqtt://broker.local:1883"
"#
    ))
    .expect("test config should parse")
}

/// A running bridge plus the handles tests observe it through
#[allow(dead_code)]
pub struct TestBridge {
    pub bridge: TelemetryBridge,
    pub resume: RecordingResume,
    pub commands: RecordingCommands,
}

#[allow(dead_code)]
pub fn start_bridge(config: &BridgeConfig, transport: MockTransport, link: MockLink) -> TestBridge {
    let resume = RecordingResume::new();
    let commands = RecordingCommands::new();
    let bridge = TelemetryBridge::start(
        config,
        transport,
        link,
        Arc::new(resume.clone()),
        Arc::new(commands.clone()),
    )
    .expect("bridge should start");

    TestBridge {
        bridge,
        resume,
        commands,
    }
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Fail the test if `future` does not finish within five seconds
#[allow(dead_code)]
pub async fn within_deadline<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}
