//! Registry of active connection push handles.
//!
//! `SessionRegistry` stores non-owning weak references to [`EventPushHandle`]s,
//! allowing application tasks to push event envelopes to live connections
//! without preventing their cleanup. Dead entries can be pruned
//! opportunistically or lazily at lookup time.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::debug;

use crate::{
    codec::{self, CodecError},
    envelope::Envelope,
    outbound::{OutboundQueue, QueueClosed},
};

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Errors raised when pushing an event to a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PushError {
    /// The connection's outbound queue has closed.
    #[error("connection closed")]
    Closed(#[from] QueueClosed),
    /// The event envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub(crate) struct PushHandleInner {
    queue: OutboundQueue,
}

/// Handle for pushing event envelopes onto one connection's outbound queue.
///
/// Events bypass request correlation entirely: they are enqueued behind any
/// pending replies and delivered to the peer's event sink in order.
#[derive(Clone)]
pub struct EventPushHandle {
    inner: Arc<PushHandleInner>,
}

impl EventPushHandle {
    pub(crate) fn new(queue: OutboundQueue) -> Self {
        Self {
            inner: Arc::new(PushHandleInner { queue }),
        }
    }

    pub(crate) fn from_arc(inner: Arc<PushHandleInner>) -> Self { Self { inner } }

    pub(crate) fn downgrade(&self) -> Weak<PushHandleInner> { Arc::downgrade(&self.inner) }

    /// Push one event to this connection.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] if the connection is shutting down and
    /// [`PushError::Codec`] if the envelope cannot be encoded.
    pub fn push_event(
        &self,
        name: &str,
        payload: Option<Box<RawValue>>,
    ) -> Result<(), PushError> {
        let bytes = codec::encode(&Envelope::event(name, payload))?;
        self.push_raw(&bytes)?;
        Ok(())
    }

    pub(crate) fn push_raw(&self, bytes: &[u8]) -> Result<(), QueueClosed> {
        self.inner.queue.enqueue(bytes)
    }
}

/// Concurrent registry of push handles keyed by [`ConnectionId`].
#[derive(Default)]
pub struct SessionRegistry(DashMap<ConnectionId, Weak<PushHandleInner>>);

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Retrieve a push handle for `id` if the connection is still alive.
    pub fn get(&self, id: &ConnectionId) -> Option<EventPushHandle> {
        let guard = self.0.get(id);
        let handle = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if handle.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        handle.map(EventPushHandle::from_arc)
    }

    /// Insert a handle for a newly established connection.
    pub fn insert(&self, id: ConnectionId, handle: &EventPushHandle) {
        self.0.insert(id, handle.downgrade());
    }

    /// Remove a handle, typically on connection teardown.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Remove all stale weak references without returning any handles.
    ///
    /// `DashMap::retain` acquires per-bucket write locks, so other operations
    /// may contend briefly while the registry is pruned.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale weak references, then collect the remaining live handles.
    #[must_use]
    pub fn active_handles(&self) -> Vec<(ConnectionId, EventPushHandle)> {
        let mut handles = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if let Some(inner) = weak.upgrade() {
                handles.push((*id, EventPushHandle::from_arc(inner)));
                true
            } else {
                false
            }
        });
        handles
    }

    /// Prune stale weak references, then return the IDs of the live connections.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    /// Push one event to every live connection.
    ///
    /// The envelope is encoded once and enqueued on each connection's
    /// outbound queue. Connections that closed mid-broadcast are skipped.
    /// Returns the number of connections the event was enqueued for.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Codec`] if the envelope cannot be encoded.
    pub fn broadcast_event(
        &self,
        name: &str,
        payload: Option<&RawValue>,
    ) -> Result<usize, PushError> {
        let envelope = Envelope::event(name, payload.map(ToOwned::to_owned));
        let bytes = codec::encode(&envelope)?;
        let mut delivered = 0;
        for (id, handle) in self.active_handles() {
            match handle.push_raw(&bytes) {
                Ok(()) => delivered += 1,
                Err(QueueClosed) => debug!(%id, "skipping closed connection in broadcast"),
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;

    #[test]
    fn dead_entries_are_pruned_lazily() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new(1);
        let handle = EventPushHandle::new(OutboundQueue::new());
        registry.insert(id, &handle);
        assert!(registry.get(&id).is_some());

        drop(handle);
        assert!(registry.get(&id).is_none());
        assert!(registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_live_connection() {
        let registry = SessionRegistry::new();
        let first_queue = OutboundQueue::new();
        let second_queue = OutboundQueue::new();
        let first = EventPushHandle::new(first_queue.clone());
        let second = EventPushHandle::new(second_queue.clone());
        registry.insert(ConnectionId::new(1), &first);
        registry.insert(ConnectionId::new(2), &second);

        let delivered = registry
            .broadcast_event("tick", None)
            .expect("event encodes");
        assert_eq!(delivered, 2);

        for queue in [first_queue, second_queue] {
            let batch = queue.dequeue_batch().await.expect("event queued");
            let message = batch.messages().next().expect("one message");
            let head = crate::codec::peek(&message).expect("valid envelope");
            assert_eq!(head.kind, EnvelopeKind::Event);
            assert_eq!(head.req_id, None);
        }
    }

    #[test]
    fn push_to_closed_connection_is_reported() {
        let queue = OutboundQueue::new();
        queue.close();
        let handle = EventPushHandle::new(queue);
        let err = handle.push_event("tick", None).expect_err("queue closed");
        assert!(matches!(err, PushError::Closed(QueueClosed)));
    }
}
