//! One accepted WebSocket connection: a send loop and a receive loop running
//! concurrently over a single socket.
//!
//! The receive loop decodes inbound envelopes and hands each request to the
//! injected executor on its own task, so a slow request never delays the
//! reply to a later one; completed results are enqueued in completion order.
//! The send loop is the socket's only writer. A session lives for exactly one
//! socket and is discarded on disconnect, never reused.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{StreamExt, stream::SplitStream};
use serde_json::value::RawValue;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::AbortHandle,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    codec,
    envelope::{Envelope, ErrorInfo, ReqId},
    executor::{TaskExecutor, execute_guarded},
    framing,
    metrics::{self, Direction},
    outbound::OutboundQueue,
    session::{ConnectionId, EventPushHandle},
};

/// Lifecycle of one accepted connection. States only move forward; a new
/// socket gets a new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Both loops are running.
    Open,
    /// The receive loop has stopped; queued replies are flushing.
    Closing,
    /// The socket is closed and both loops have exited.
    Closed,
}

/// Host-side session for one accepted WebSocket.
pub struct ConnectionSession {
    id: ConnectionId,
    executor: Arc<dyn TaskExecutor>,
    push: EventPushHandle,
    outbound: OutboundQueue,
    shutdown: CancellationToken,
    state: Mutex<SessionState>,
    in_flight: Mutex<HashMap<ReqId, Option<AbortHandle>>>,
}

impl ConnectionSession {
    /// Create a session for a freshly accepted socket.
    ///
    /// `shutdown` lets the server ask the session to close without waiting
    /// for the peer; pass a fresh token when no external shutdown exists.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        executor: Arc<dyn TaskExecutor>,
        arena_capacity: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let outbound = OutboundQueue::with_arena_capacity(arena_capacity);
        Arc::new(Self {
            id,
            executor,
            push: EventPushHandle::new(outbound.clone()),
            outbound,
            shutdown,
            state: Mutex::new(SessionState::Open),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// This session's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState { *self.lock_state() }

    /// Handle for pushing events to this connection.
    ///
    /// The handle keeps the outbound queue reachable for as long as it is
    /// held; registries should store it weakly via
    /// [`crate::session::SessionRegistry::insert`].
    #[must_use]
    pub fn push_handle(&self) -> EventPushHandle { self.push.clone() }

    /// Drive the session until the peer disconnects or shutdown is requested.
    ///
    /// Spawns the send loop, runs the receive loop on the calling task, and
    /// on exit flushes every already-enqueued reply before the socket closes.
    pub async fn run<S>(self: Arc<Self>, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        metrics::inc_connections();
        info!(id = %self.id, "connection open");

        let (sink, stream) = ws.split();
        let send_task = tokio::spawn(framing::send_loop(sink, self.outbound.clone()));

        Self::receive_loop(&self, stream).await;
        self.advance(SessionState::Closing);

        // The peer is gone; stop work that no longer has a recipient. Replies
        // already enqueued still flush below.
        let abandoned: Vec<_> = self.lock_in_flight().drain().collect();
        for (req_id, handle) in abandoned {
            if let Some(handle) = handle {
                debug!(id = %self.id, req_id, "aborting in-flight task at teardown");
                handle.abort();
            }
        }

        self.outbound.close();
        if let Err(e) = send_task.await {
            error!(id = %self.id, error = %e, "send loop task failed");
        }

        self.advance(SessionState::Closed);
        metrics::dec_connections();
        info!(id = %self.id, "connection closed");
    }

    async fn receive_loop<S>(session: &Arc<Self>, mut stream: SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                () = session.shutdown.cancelled() => {
                    debug!(id = %session.id, "shutdown requested");
                    return;
                }
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => Self::handle_message(session, text.as_bytes()),
                Some(Ok(Message::Binary(_))) => {
                    warn!(id = %session.id, "rejecting non-text message");
                    metrics::inc_errors();
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(id = %session.id, "peer sent close frame");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(id = %session.id, error = %e, "socket read failed");
                    return;
                }
                None => return,
            }
        }
    }

    /// Route one fully assembled logical message.
    ///
    /// A malformed message is answered with an error envelope when its
    /// `reqId` could still be peeked, and logged otherwise; either way the
    /// connection stays up.
    fn handle_message(session: &Arc<Self>, bytes: &[u8]) {
        metrics::inc_messages(Direction::Inbound);
        let head = codec::peek(bytes);
        match codec::decode(bytes) {
            Ok(Envelope::Request { req_id, payload }) => {
                Self::spawn_execute(session, req_id, payload);
            }
            Ok(Envelope::Batch { requests }) => {
                for item in requests {
                    Self::spawn_execute(session, item.req_id, item.payload);
                }
            }
            Ok(Envelope::Cancel { req_id }) => session.abort_in_flight(req_id),
            Ok(other) => {
                warn!(id = %session.id, kind = %other.kind(), "discarding unexpected message kind");
                metrics::inc_errors();
            }
            Err(e) => {
                warn!(id = %session.id, error = %e, "received malformed message");
                metrics::inc_errors();
                if let Some(req_id) = head.ok().and_then(|head| head.req_id) {
                    session.enqueue_reply(Envelope::error(
                        req_id,
                        ErrorInfo::bad_request(e.to_string()),
                    ));
                }
            }
        }
    }

    /// Run one request on its own task and enqueue the reply on completion.
    fn spawn_execute(session: &Arc<Self>, req_id: ReqId, payload: Box<RawValue>) {
        // Reserve the slot first so the task's cleanup always finds it, even
        // if the task finishes before the abort handle is stored.
        session.lock_in_flight().insert(req_id, None);
        let task_session = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let reply = match execute_guarded(&task_session.executor, payload).await {
                Ok(result) => Envelope::response(req_id, result),
                Err(error) => Envelope::error(req_id, error),
            };
            task_session.enqueue_reply(reply);
            task_session.lock_in_flight().remove(&req_id);
        });
        if let Some(slot) = session.lock_in_flight().get_mut(&req_id) {
            *slot = Some(handle.abort_handle());
        }
    }

    /// Best-effort stop of a request the caller abandoned. The task may
    /// already have completed; an abort then is a no-op.
    fn abort_in_flight(&self, req_id: ReqId) {
        if let Some(Some(handle)) = self.lock_in_flight().remove(&req_id) {
            debug!(id = %self.id, req_id, "aborting task on cancel notice");
            handle.abort();
        }
    }

    fn enqueue_reply(&self, envelope: Envelope) {
        match codec::encode(&envelope) {
            Ok(bytes) => {
                if self.outbound.enqueue(&bytes).is_err() {
                    debug!(id = %self.id, "dropping reply for closed connection");
                }
            }
            Err(e) => {
                error!(id = %self.id, error = %e, "failed to encode reply");
                metrics::inc_errors();
            }
        }
    }

    fn advance(&self, next: SessionState) {
        let mut state = self.lock_state();
        if *state < next {
            debug!(id = %self.id, from = ?*state, to = ?next, "session state change");
            *state = next;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<ReqId, Option<AbortHandle>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
