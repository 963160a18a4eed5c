//! Correlation of in-flight requests to their eventual replies.
//!
//! Each outbound request registers a [`PendingReply`] keyed by its `reqId`
//! *before* the bytes reach the wire, so a reply racing ahead of the write is
//! never missed. An entry is removed exactly once: by the matching reply, by
//! the caller abandoning the wait, or by [`RequestCorrelator::cancel_all`] at
//! connection teardown.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::envelope::{ErrorInfo, ReqId};

/// Resolution of a pending request.
#[derive(Debug)]
pub enum CallReply {
    /// The host answered with a result payload.
    Response(Box<RawValue>),
    /// The host answered with a structured failure.
    Error(ErrorInfo),
    /// The connection was torn down before an answer arrived.
    Cancelled,
}

/// A `reqId` was registered twice.
///
/// Identifiers are assigned by a monotonic counter, so this indicates a logic
/// error in the session, not bad input.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("request id {0} is already pending")]
pub struct DuplicateRequestId(pub ReqId);

/// A reply referenced a `reqId` with no pending entry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no pending request with id {0}")]
pub struct UnknownReqId(pub ReqId);

/// Concurrent map from `reqId` to the handle that resolves the waiting call.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<ReqId, oneshot::Sender<CallReply>>>,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReqId, oneshot::Sender<CallReply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending request and return the handle the caller awaits.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateRequestId`] if `req_id` is already pending.
    pub fn register(&self, req_id: ReqId) -> Result<PendingReply, DuplicateRequestId> {
        let (tx, rx) = oneshot::channel();
        match self.lock().entry(req_id) {
            Entry::Occupied(_) => Err(DuplicateRequestId(req_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingReply { rx })
            }
        }
    }

    /// Resolve the pending request for `req_id` with `reply`.
    ///
    /// The entry is removed even when the caller has already abandoned the
    /// wait; delivery to a gone caller is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownReqId`] if no such request is pending.
    pub fn complete(&self, req_id: ReqId, reply: CallReply) -> Result<(), UnknownReqId> {
        let tx = self.lock().remove(&req_id).ok_or(UnknownReqId(req_id))?;
        let _ = tx.send(reply);
        Ok(())
    }

    /// Drop the pending entry for `req_id` without resolving it.
    ///
    /// Used when the caller stops waiting locally (cancellation, timeout) so
    /// the entry does not outlive its call. Returns whether an entry existed.
    pub fn forget(&self, req_id: ReqId) -> bool { self.lock().remove(&req_id).is_some() }

    /// Resolve every pending request with [`CallReply::Cancelled`].
    ///
    /// Entries are drained under the lock into a snapshot and resolved after
    /// it is released, so nothing a waiter does on wake can re-enter the map
    /// while it is held. Calling this twice is harmless: the second call sees
    /// an empty map and no request is ever resolved more than once.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(CallReply::Cancelled);
        }
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize { self.lock().len() }
}

/// The awaitable half of a registered request. Resolves exactly once.
pub struct PendingReply {
    rx: oneshot::Receiver<CallReply>,
}

impl PendingReply {
    /// Wait for the reply.
    ///
    /// A correlator dropped without resolving this entry counts as
    /// cancellation, so the wait can never hang past teardown.
    pub async fn wait(self) -> CallReply { self.rx.await.unwrap_or(CallReply::Cancelled) }
}
