//! Client session: coalesced connect, correlated calls, and event delivery.
//!
//! A [`ClientSession`] owns at most one live connection at a time. Concurrent
//! callers needing a connection share a single in-flight connect attempt; a
//! dropped connection is discarded and the next call dials a fresh socket.
//! Each call registers with the connection's correlator *before* its bytes
//! are enqueued, so a reply racing ahead of the write is never missed, and
//! replies are matched by `reqId` rather than arrival order.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt, StreamExt,
    future::{BoxFuture, Shared},
    stream::SplitStream,
};
use serde_json::value::RawValue;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config, tungstenite::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClientError, ConnectError};
use crate::{
    codec,
    config::ClientConfig,
    correlator::{CallReply, RequestCorrelator},
    envelope::{Envelope, EnvelopeKind, ReqId},
    executor::{EventSink, FnEventSink, PushedEvent},
    framing,
    metrics::{self, Direction},
    outbound::OutboundQueue,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedConnect = Shared<BoxFuture<'static, Result<Arc<Connection>, ConnectError>>>;

/// Per-call overrides for [`ClientSession::call_with`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Deadline for this call; overrides the session's default when set.
    pub timeout: Option<Duration>,
    /// Cancelling this token aborts the wait immediately and sends the host
    /// a best-effort cancel notice.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Options with a call deadline.
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Options with a caller-supplied cancellation token.
    #[must_use]
    pub fn cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }
}

/// Builder for [`ClientSession`].
pub struct ClientSessionBuilder {
    config: ClientConfig,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl ClientSessionBuilder {
    /// Override the time allowed for the dial and handshake.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the default per-call deadline; `None` waits until the reply
    /// or the connection teardown resolves the call.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the sink pushed events are delivered to.
    #[must_use]
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.event_sink = Some(Arc::new(sink));
        self
    }

    /// Register a plain closure as the event sink.
    #[must_use]
    pub fn on_event(mut self, handler: impl Fn(PushedEvent) + Send + Sync + 'static) -> Self {
        self.event_sink = Some(Arc::new(FnEventSink(handler)));
        self
    }

    /// Finish the builder. No socket is dialled until the first call.
    #[must_use]
    pub fn build(self) -> ClientSession {
        ClientSession {
            config: self.config,
            event_sink: self.event_sink,
            next_req_id: AtomicI32::new(1),
            connect_slot: Mutex::new(None),
        }
    }
}

/// Client endpoint for correlated calls over one WebSocket connection.
///
/// # Examples
///
/// ```no_run
/// use serde_json::value::RawValue;
/// use taskwire::client::ClientSession;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), taskwire::client::ClientError> {
/// let session = ClientSession::builder("ws://127.0.0.1:9000/").build();
/// let payload = RawValue::from_string(r#"{"op":"ping"}"#.into()).expect("valid JSON");
/// let reply = session.call(payload).await?;
/// println!("{}", reply.get());
/// # Ok(())
/// # }
/// ```
pub struct ClientSession {
    config: ClientConfig,
    event_sink: Option<Arc<dyn EventSink>>,
    next_req_id: AtomicI32,
    connect_slot: Mutex<Option<SharedConnect>>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("url", &self.config.url)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Start building a session for `url`.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientSessionBuilder {
        ClientSessionBuilder {
            config: ClientConfig::new(url),
            event_sink: None,
        }
    }

    /// Session for `url` with default settings and no event sink.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        ClientSessionBuilder {
            config,
            event_sink: None,
        }
        .build()
    }

    /// Issue the next request identifier.
    ///
    /// Identifiers increase monotonically and are unique for this session
    /// instance. The counter is a 32-bit signed increment with no wraparound
    /// handling.
    fn next_req_id(&self) -> ReqId { self.next_req_id.fetch_add(1, Ordering::Relaxed) }

    /// Send one request and await its correlated reply, using the session's
    /// default deadline.
    ///
    /// # Errors
    ///
    /// See [`call_with`](Self::call_with).
    pub async fn call(&self, payload: Box<RawValue>) -> Result<Box<RawValue>, ClientError> {
        self.call_with(payload, CallOptions::default()).await
    }

    /// Send one request and await its correlated reply.
    ///
    /// The pending reply is registered before the request bytes are enqueued,
    /// and the call resolves as soon as the matching reply arrives, however
    /// many later requests complete first.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Connect`] when no connection could be established.
    /// - [`ClientError::Task`] when the host reports a task failure.
    /// - [`ClientError::Timeout`] when the deadline passes first.
    /// - [`ClientError::Cancelled`] when the caller's token fires first.
    /// - [`ClientError::ConnectionClosed`] when the connection is torn down
    ///   before the reply arrives.
    pub async fn call_with(
        &self,
        payload: Box<RawValue>,
        options: CallOptions,
    ) -> Result<Box<RawValue>, ClientError> {
        let connection = self.connection().await?;
        let req_id = self.next_req_id();
        let pending = connection.correlator.register(req_id)?;

        let bytes = codec::encode(&Envelope::request(req_id, payload))?;
        if connection.outbound.enqueue(&bytes).is_err() {
            connection.correlator.forget(req_id);
            return Err(ClientError::ConnectionClosed);
        }

        let deadline = options.timeout.or(self.config.request_timeout);
        let wait = pending.wait();
        tokio::pin!(wait);
        let reply = tokio::select! {
            reply = &mut wait => reply,
            () = cancelled(options.cancel.as_ref()) => {
                abandon(&connection, req_id);
                return Err(ClientError::Cancelled);
            }
            () = sleep_until(deadline) => {
                abandon(&connection, req_id);
                return Err(ClientError::Timeout(deadline.unwrap_or_default()));
            }
        };
        match reply {
            CallReply::Response(result) => Ok(result),
            CallReply::Error(error) => Err(ClientError::Task(error)),
            CallReply::Cancelled => Err(ClientError::ConnectionClosed),
        }
    }

    /// Establish the connection without sending anything.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] when the dial or handshake fails.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection().await.map(|_| ())
    }

    /// Close the current connection, if any.
    ///
    /// Outstanding calls resolve with [`ClientError::ConnectionClosed`]; a
    /// later call dials a fresh socket.
    pub async fn close(&self) {
        let slot = self.lock_slot().take();
        if let Some(fut) = slot
            && let Ok(connection) = fut.await
        {
            connection.shutdown();
        }
    }

    /// Return the live connection, dialling one if needed.
    ///
    /// Concurrent callers share a single in-flight connect attempt; the
    /// first caller creates the shared future, later callers await it. A
    /// failed or since-closed connection clears the slot so the next caller
    /// retries fresh.
    async fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        loop {
            let fut = {
                let mut slot = self.lock_slot();
                if let Some(fut) = slot.as_ref() {
                    fut.clone()
                } else {
                    let fut = Connection::open(self.config.clone(), self.event_sink.clone())
                        .boxed()
                        .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            };
            match fut.clone().await {
                Ok(connection) if !connection.is_closed() => return Ok(connection),
                Ok(_stale) => self.clear_slot_if(&fut),
                Err(error) => {
                    self.clear_slot_if(&fut);
                    return Err(error.into());
                }
            }
        }
    }

    /// Clear the connect slot only if it still holds `fut`, so a newer
    /// attempt started by another caller is left untouched.
    fn clear_slot_if(&self, fut: &SharedConnect) {
        let mut slot = self.lock_slot();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(fut)) {
            *slot = None;
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<SharedConnect>> {
        self.connect_slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

/// Forget a call the caller stopped waiting for and tell the host, best
/// effort. The host may already have finished; that race is harmless.
fn abandon(connection: &Connection, req_id: ReqId) {
    connection.correlator.forget(req_id);
    if let Ok(bytes) = codec::encode(&Envelope::cancel(req_id)) {
        let _ = connection.outbound.enqueue(&bytes);
    }
}

/// One live physical connection. Discarded on teardown, never resurrected.
struct Connection {
    outbound: OutboundQueue,
    correlator: RequestCorrelator,
    closed: CancellationToken,
}

impl Connection {
    async fn open(
        config: ClientConfig,
        event_sink: Option<Arc<dyn EventSink>>,
    ) -> Result<Arc<Self>, ConnectError> {
        debug!(url = %config.url, "dialling");
        let handshake =
            connect_async_with_config(config.url.clone(), Some(config.ws_config()), false);
        let (ws, _response) = match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                return Err(ConnectError::Handshake {
                    url: config.url,
                    source: Arc::new(e),
                });
            }
            Err(_) => {
                return Err(ConnectError::Timeout {
                    url: config.url,
                    timeout: config.connect_timeout,
                });
            }
        };
        info!(url = %config.url, "connected");

        let connection = Arc::new(Self {
            outbound: OutboundQueue::with_arena_capacity(config.arena_capacity),
            correlator: RequestCorrelator::new(),
            closed: CancellationToken::new(),
        });
        let (sink, stream) = ws.split();
        tokio::spawn(framing::send_loop(sink, connection.outbound.clone()));
        tokio::spawn(receive_loop(stream, Arc::clone(&connection), event_sink));
        Ok(connection)
    }

    fn is_closed(&self) -> bool { self.closed.is_cancelled() }

    /// Tear the connection down: stop both loops and resolve every pending
    /// call exactly once. Safe to invoke from multiple places.
    fn shutdown(&self) {
        self.closed.cancel();
        self.outbound.close();
        self.correlator.cancel_all();
    }
}

/// Demultiplex inbound messages: replies resolve their pending call through
/// the correlator, events go straight to the sink.
async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    connection: Arc<Connection>,
    event_sink: Option<Arc<dyn EventSink>>,
) {
    loop {
        let message = tokio::select! {
            () = connection.closed.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                handle_inbound(&connection, event_sink.as_deref(), text.as_bytes()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                warn!("rejecting non-text message from host");
                metrics::inc_errors();
            }
            Some(Ok(Message::Close(_))) => {
                debug!("host sent close frame");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "socket read failed");
                break;
            }
            None => break,
        }
    }
    connection.shutdown();
}

async fn handle_inbound(
    connection: &Connection,
    event_sink: Option<&dyn EventSink>,
    bytes: &[u8],
) {
    metrics::inc_messages(Direction::Inbound);
    let head = match codec::peek(bytes) {
        Ok(head) => head,
        Err(e) => {
            warn!(error = %e, "discarding malformed message");
            metrics::inc_errors();
            return;
        }
    };
    match head.kind {
        EnvelopeKind::Response | EnvelopeKind::Error => match codec::decode(bytes) {
            Ok(Envelope::Response { req_id, payload }) => {
                resolve(connection, req_id, CallReply::Response(payload));
            }
            Ok(Envelope::Error { req_id, error }) => {
                resolve(connection, req_id, CallReply::Error(error));
            }
            Ok(_) | Err(_) => {
                warn!(kind = %head.kind, "discarding malformed reply");
                metrics::inc_errors();
            }
        },
        EnvelopeKind::Event => match codec::decode(bytes) {
            Ok(Envelope::Event { name, payload }) => {
                if let Some(sink) = event_sink {
                    sink.on_event(PushedEvent { name, payload }).await;
                } else {
                    debug!(event = %name, "no event sink registered, dropping event");
                }
            }
            Ok(_) => {
                warn!("event envelope decoded to an unexpected kind");
                metrics::inc_errors();
            }
            Err(e) => {
                warn!(error = %e, "discarding malformed event");
                metrics::inc_errors();
            }
        },
        kind => {
            warn!(%kind, "discarding unexpected message kind from host");
            metrics::inc_errors();
        }
    }
}

/// A reply for an unknown `reqId` breaks the correlator invariant; it is
/// logged at error severity and the message dropped, keeping the loop alive.
fn resolve(connection: &Connection, req_id: ReqId, reply: CallReply) {
    if let Err(e) = connection.correlator.complete(req_id, reply) {
        error!(error = %e, "reply does not match any pending request");
        metrics::inc_errors();
    }
}
