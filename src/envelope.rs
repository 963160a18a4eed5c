//! Protocol envelope model.
//!
//! Every logical message on the wire is one [`Envelope`]: a tagged union over
//! requests, responses, error responses, pushed events, request batches, and
//! best-effort cancel notices. Requests and replies carry a [`ReqId`] used to
//! correlate them; events never do. Payloads are opaque JSON
//! ([`serde_json::value::RawValue`]), so the transport never materializes
//! application data.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Request identifier assigned by the client.
///
/// Identifiers are monotonically increasing and unique for the lifetime of
/// one client session. The counter is a 32-bit signed value with no
/// wraparound handling; a session is not expected to issue 2^31 requests.
pub type ReqId = i32;

/// Wire discriminator for an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A task request expecting a correlated reply.
    Request,
    /// Several requests submitted together.
    Batch,
    /// A successful reply to a request.
    Response,
    /// A failed reply to a request.
    Error,
    /// A host-pushed notification outside request correlation.
    Event,
    /// A best-effort notice that a request's caller stopped waiting.
    Cancel,
}

impl EnvelopeKind {
    /// The `type` field value for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Batch => "batch",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Event => "event",
            EnvelopeKind::Cancel => "cancel",
        }
    }

    /// Resolve a wire discriminator, returning `None` for unknown values.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "request" => Some(EnvelopeKind::Request),
            "batch" => Some(EnvelopeKind::Batch),
            "response" => Some(EnvelopeKind::Response),
            "error" => Some(EnvelopeKind::Error),
            "event" => Some(EnvelopeKind::Event),
            "cancel" => Some(EnvelopeKind::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Category of a task failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// The request itself was unusable.
    BadRequest,
    /// The host failed while processing the request.
    Internal,
    /// Processing stopped before a result was produced.
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::BadRequest => "badRequest",
            ErrorCode::Internal => "internal",
            ErrorCode::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Structured failure information carried by an error envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Failure category.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl ErrorInfo {
    /// Create failure information with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a [`ErrorCode::BadRequest`] failure.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Shorthand for an [`ErrorCode::Internal`] failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self { Self::new(ErrorCode::Internal, message) }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// One element of a batch envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestItem {
    /// Correlation identifier for this element's reply.
    pub req_id: ReqId,
    /// Opaque task payload.
    pub payload: Box<RawValue>,
}

/// A logical protocol message.
#[derive(Debug)]
pub enum Envelope {
    /// A task request; the host replies with a [`Envelope::Response`] or
    /// [`Envelope::Error`] carrying the same `req_id`.
    Request {
        /// Correlation identifier assigned by the client.
        req_id: ReqId,
        /// Opaque task payload.
        payload: Box<RawValue>,
    },
    /// Several requests submitted together. Each element is answered
    /// independently; replies may arrive in any order.
    Batch {
        /// The batched requests.
        requests: Vec<RequestItem>,
    },
    /// A successful reply.
    Response {
        /// Identifier of the request being answered.
        req_id: ReqId,
        /// Opaque result payload.
        payload: Box<RawValue>,
    },
    /// A failed reply.
    Error {
        /// Identifier of the request being answered.
        req_id: ReqId,
        /// What went wrong.
        error: ErrorInfo,
    },
    /// A host-pushed notification. Never carries a `req_id`.
    Event {
        /// Event name understood by the application layer.
        name: String,
        /// Optional opaque event payload.
        payload: Option<Box<RawValue>>,
    },
    /// Best-effort notice that the caller of `req_id` stopped waiting.
    Cancel {
        /// Identifier of the abandoned request.
        req_id: ReqId,
    },
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(req_id: ReqId, payload: Box<RawValue>) -> Self {
        Envelope::Request { req_id, payload }
    }

    /// Build a batch envelope.
    #[must_use]
    pub fn batch(requests: Vec<RequestItem>) -> Self { Envelope::Batch { requests } }

    /// Build a response envelope.
    #[must_use]
    pub fn response(req_id: ReqId, payload: Box<RawValue>) -> Self {
        Envelope::Response { req_id, payload }
    }

    /// Build an error-response envelope.
    #[must_use]
    pub fn error(req_id: ReqId, error: ErrorInfo) -> Self { Envelope::Error { req_id, error } }

    /// Build an event envelope.
    #[must_use]
    pub fn event(name: impl Into<String>, payload: Option<Box<RawValue>>) -> Self {
        Envelope::Event {
            name: name.into(),
            payload,
        }
    }

    /// Build a cancel notice.
    #[must_use]
    pub fn cancel(req_id: ReqId) -> Self { Envelope::Cancel { req_id } }

    /// The discriminator for this envelope.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request { .. } => EnvelopeKind::Request,
            Envelope::Batch { .. } => EnvelopeKind::Batch,
            Envelope::Response { .. } => EnvelopeKind::Response,
            Envelope::Error { .. } => EnvelopeKind::Error,
            Envelope::Event { .. } => EnvelopeKind::Event,
            Envelope::Cancel { .. } => EnvelopeKind::Cancel,
        }
    }

    /// The correlation identifier, if this envelope kind carries one.
    #[must_use]
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            Envelope::Request { req_id, .. }
            | Envelope::Response { req_id, .. }
            | Envelope::Error { req_id, .. }
            | Envelope::Cancel { req_id } => Some(*req_id),
            Envelope::Batch { .. } | Envelope::Event { .. } => None,
        }
    }
}

/// The routing-relevant prefix of an envelope: discriminator and `reqId`.
///
/// Produced by [`crate::codec::peek`] so receive loops can route a message
/// before paying for full deserialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopeHead {
    /// Message discriminator.
    pub kind: EnvelopeKind,
    /// Correlation identifier, when present.
    pub req_id: Option<ReqId>,
}
