#![doc(html_root_url = "https://docs.rs/taskwire/latest")]
//! Public API for the `taskwire` library.
//!
//! This crate provides the remote transport and RPC-correlation layer for
//! batched, JSON-encoded task exchanges: a duplex WebSocket session on each
//! side (one send loop, one receive loop, replies correlated by `reqId` and
//! allowed to complete out of order), a degenerate single-shot HTTP path
//! sharing the same envelope codec, and a side-channel for host-pushed
//! events. Task payloads stay opaque; the application layer supplies a
//! [`TaskExecutor`] on the host and an [`EventSink`] on the client.

pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod executor;
mod framing;
pub mod host;
pub mod metrics;
pub mod outbound;
pub mod session;

pub use client::{CallOptions, ClientError, ClientSession};
pub use codec::CodecError;
pub use config::{ClientConfig, ServerConfig};
pub use correlator::{CallReply, RequestCorrelator};
pub use envelope::{Envelope, EnvelopeHead, EnvelopeKind, ErrorCode, ErrorInfo, ReqId};
pub use executor::{EventSink, PushedEvent, TaskExecutor};
pub use host::{ServerError, TaskwireServer};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, MESSAGES_PROCESSED};
pub use outbound::OutboundQueue;
pub use session::{ConnectionId, EventPushHandle, SessionRegistry};
