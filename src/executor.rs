//! Collaborator boundary between the transport and the application layer.
//!
//! The transport hands every decoded request payload to a [`TaskExecutor`]
//! and every pushed event to an [`EventSink`]; it has no knowledge of what
//! either payload means.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::value::RawValue;
use tracing::error;

use crate::envelope::ErrorInfo;

/// Executes one task payload and produces the reply payload.
///
/// A returned [`ErrorInfo`] travels back to the caller as an error envelope
/// through the normal response channel; it never affects the connection.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Process `payload` and return the response payload.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorInfo`] describing the failure to report to the caller.
    async fn execute(&self, payload: Box<RawValue>) -> Result<Box<RawValue>, ErrorInfo>;
}

/// An event pushed by the host outside request correlation.
#[derive(Clone, Debug)]
pub struct PushedEvent {
    /// Event name understood by the application layer.
    pub name: String,
    /// Optional opaque event payload.
    pub payload: Option<Box<RawValue>>,
}

/// Receives events pushed by the host.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Called once per received event envelope, in arrival order.
    async fn on_event(&self, event: PushedEvent);
}

/// Adapter implementing [`EventSink`] for a plain closure.
pub(crate) struct FnEventSink<F>(pub(crate) F);

#[async_trait]
impl<F> EventSink for FnEventSink<F>
where
    F: Fn(PushedEvent) + Send + Sync,
{
    async fn on_event(&self, event: PushedEvent) { (self.0)(event); }
}

/// Run the executor with a panic guard.
///
/// A panicking executor must not take the connection down with it; the panic
/// is logged and reported to the caller as an internal error.
pub(crate) async fn execute_guarded(
    executor: &Arc<dyn TaskExecutor>,
    payload: Box<RawValue>,
) -> Result<Box<RawValue>, ErrorInfo> {
    match AssertUnwindSafe(executor.execute(payload)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic_message(&panic);
            error!(panic = %detail, "task executor panicked");
            crate::metrics::inc_errors();
            Err(ErrorInfo::internal(format!("task panicked: {detail}")))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
