//! Accept loop and builder for the taskwire host.
//!
//! The server owns one TCP listener and serves each accepted socket with
//! hyper's HTTP/1 connection driver. Requests that ask for a WebSocket
//! upgrade become long-lived [`ConnectionSession`]s; everything else goes
//! through the single-shot path in [`super::http`].

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::warn;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use super::{ServerError, connection::ConnectionSession, http};
use crate::{
    config::ServerConfig,
    executor::TaskExecutor,
    session::{ConnectionId, SessionRegistry},
};

struct Shared {
    executor: Arc<dyn TaskExecutor>,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

/// Builder for [`TaskwireServer`].
#[derive(Default)]
pub struct TaskwireServerBuilder {
    executor: Option<Arc<dyn TaskExecutor>>,
    config: ServerConfig,
}

impl TaskwireServerBuilder {
    /// Set the task executor every decoded request is handed to.
    #[must_use]
    pub fn executor(mut self, executor: impl TaskExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Set the task executor from an existing shared handle.
    #[must_use]
    pub fn executor_arc(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override the server configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the listener and finish the server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::MissingExecutor`] if no executor was configured
    /// and [`ServerError::Bind`] if the listener cannot be bound.
    pub async fn bind(self, addr: SocketAddr) -> Result<TaskwireServer, ServerError> {
        let executor = self.executor.ok_or(ServerError::MissingExecutor)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(TaskwireServer {
            listener,
            shared: Arc::new(Shared {
                executor,
                config: self.config,
                registry: Arc::new(SessionRegistry::new()),
                shutdown: CancellationToken::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Host endpoint serving WebSocket sessions and single-shot HTTP requests.
///
/// # Examples
///
/// ```no_run
/// use serde_json::value::RawValue;
/// use taskwire::{ErrorInfo, TaskExecutor, host::TaskwireServer};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl TaskExecutor for Echo {
///     async fn execute(&self, payload: Box<RawValue>) -> Result<Box<RawValue>, ErrorInfo> {
///         Ok(payload)
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), taskwire::host::ServerError> {
/// let server = TaskwireServer::builder()
///     .executor(Echo)
///     .bind(([127, 0, 0, 1], 0).into())
///     .await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct TaskwireServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TaskwireServer {
    /// Start building a server.
    #[must_use]
    pub fn builder() -> TaskwireServerBuilder { TaskwireServerBuilder::default() }

    /// The address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the local address is unavailable.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> { self.listener.local_addr() }

    /// Registry of live connections, for pushing events from outside the
    /// receive path.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> { Arc::clone(&self.shared.registry) }

    /// Token that stops the accept loop and asks open sessions to close.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shared.shutdown.clone() }

    /// Run the server until the shutdown token is cancelled.
    ///
    /// # Errors
    ///
    /// Currently infallible after binding; the `Result` reserves room for
    /// future accept-loop failures. Individual accept errors are logged and
    /// do not stop the server.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves or the shutdown token is
    /// cancelled, then wait for open sessions to flush and close.
    ///
    /// # Errors
    ///
    /// Currently infallible after binding; see [`run`](Self::run).
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening");
        }
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                () = self.shared.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(stream, peer, Arc::clone(&self.shared), &tracker);
                    }
                    Err(e) => warn!("accept failed: error={e}"),
                },
            }
        }
        info!("shutting down");
        drop(self.listener);
        self.shared.shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>, tracker: &TaskTracker) {
    let sessions = tracker.clone();
    tracker.spawn(async move {
        let io = TokioIo::new(stream);
        let read_buffer_size = shared.config.read_buffer_size;
        let service = service_fn(move |req| {
            let shared = Arc::clone(&shared);
            let sessions = sessions.clone();
            async move { Ok::<_, Infallible>(route(shared, sessions, req).await) }
        });
        // hyper enforces an 8 KiB floor on its read buffer.
        if let Err(e) = http1::Builder::new()
            .max_buf_size(read_buffer_size.max(8 * 1024))
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!(%peer, error = %e, "connection ended with error");
        }
    });
}

async fn route(
    shared: Arc<Shared>,
    sessions: TaskTracker,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if hyper_tungstenite::is_upgrade_request(&req) {
        match hyper_tungstenite::upgrade(&mut req, Some(shared.config.ws_config())) {
            Ok((response, websocket)) => {
                let id = ConnectionId::new(
                    shared.next_connection_id.fetch_add(1, Ordering::Relaxed),
                );
                sessions.spawn(async move {
                    match websocket.await {
                        Ok(ws) => {
                            let session = ConnectionSession::new(
                                id,
                                Arc::clone(&shared.executor),
                                shared.config.arena_capacity,
                                shared.shutdown.child_token(),
                            );
                            shared.registry.insert(id, &session.push_handle());
                            session.run(ws).await;
                            shared.registry.remove(&id);
                        }
                        Err(e) => tracing::warn!(%id, error = %e, "websocket handshake failed"),
                    }
                });
                response
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed upgrade request");
                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Full::new(Bytes::from_static(b"malformed upgrade request")))
                    .expect("static response parts are valid")
            }
        }
    } else {
        http::handle_single_shot(&shared.executor, &shared.config, req).await
    }
}
