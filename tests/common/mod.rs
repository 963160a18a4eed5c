//! Shared utilities for integration tests.
//!
//! Provides task executors driven by their request payload, an event sink
//! backed by a channel, and a helper that runs a server on an ephemeral
//! local port. These helpers reduce duplication across test modules.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::value::RawValue;
use taskwire::{ErrorInfo, EventSink, PushedEvent, SessionRegistry, TaskExecutor, host::TaskwireServer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Parse a JSON literal into a raw payload.
pub fn raw(json: &str) -> Box<RawValue> {
    RawValue::from_string(json.to_owned()).expect("valid JSON literal")
}

/// Executor that returns the request payload unchanged.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, payload: Box<RawValue>) -> Result<Box<RawValue>, ErrorInfo> {
        Ok(payload)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Script {
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    fail: Option<String>,
}

/// Executor driven by its payload: sleeps `delayMs`, then echoes `value`,
/// or fails with an internal error carrying `fail` as the message.
pub struct ScriptedExecutor;

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, payload: Box<RawValue>) -> Result<Box<RawValue>, ErrorInfo> {
        let script: Script = serde_json::from_str(payload.get())
            .map_err(|e| ErrorInfo::bad_request(e.to_string()))?;
        if script.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        }
        if let Some(message) = script.fail {
            return Err(ErrorInfo::internal(message));
        }
        let value = script.value.unwrap_or(serde_json::Value::Null);
        Ok(raw(&value.to_string()))
    }
}

/// Event sink that forwards every delivered event into a channel.
pub struct ChannelSink(pub mpsc::UnboundedSender<PushedEvent>);

#[async_trait]
impl EventSink for ChannelSink {
    async fn on_event(&self, event: PushedEvent) { let _ = self.0.send(event); }
}

/// A server running in the background plus the handles tests drive it with.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: CancellationToken,
}

/// Install a log subscriber once so failing tests come with transport logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Bind a server on an ephemeral local port and run it in the background.
pub async fn start_server(executor: impl TaskExecutor + 'static) -> TestResult<TestServer> {
    init_tracing();
    let server = TaskwireServer::builder()
        .executor(executor)
        .bind(([127, 0, 0, 1], 0).into())
        .await?;
    let addr = server.local_addr()?;
    let registry = server.registry();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());
    Ok(TestServer {
        addr,
        registry,
        shutdown,
    })
}

/// WebSocket endpoint URL for a bound test server.
pub fn ws_url(addr: SocketAddr) -> String { format!("ws://{addr}/") }
